//! Credential strategies. Each produces the authentication fields of the
//! `CONNECT` frame; exactly one is active per connection.

use crate::error::{NatsError, Result};
use crate::info::{ConnectInfo, ServerInfo};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;

/// Signs the server-issued nonce with the private half of an nkey.
pub trait NonceSigner: Send + Sync {
    fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>>;
}

impl<F> NonceSigner for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        self(nonce)
    }
}

pub type JwtCallback = Arc<dyn Fn() -> Result<String> + Send + Sync>;

#[derive(Clone)]
pub enum JwtSource {
    Static(String),
    Callback(JwtCallback),
}

impl JwtSource {
    pub fn resolve(&self) -> Result<String> {
        match self {
            Self::Static(jwt) => Ok(jwt.clone()),
            Self::Callback(cb) => cb(),
        }
    }
}

impl fmt::Debug for JwtSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("JwtSource::Static(<redacted>)"),
            Self::Callback(_) => f.write_str("JwtSource::Callback"),
        }
    }
}

/// Produces the `CONNECT` authentication fields for one credential variant.
pub trait Authenticator: Send + Sync + fmt::Debug {
    fn method(&self) -> &'static str;

    /// Whether this variant can answer a nonce challenge.
    fn signs_nonce(&self) -> bool {
        false
    }

    fn apply(&self, info: &ServerInfo, connect: &mut ConnectInfo) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn method(&self) -> &'static str {
        "none"
    }

    fn apply(&self, _info: &ServerInfo, _connect: &mut ConnectInfo) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct UserPasswordAuth {
    pub user: String,
    pub pass: Option<String>,
}

impl fmt::Debug for UserPasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPasswordAuth")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Authenticator for UserPasswordAuth {
    fn method(&self) -> &'static str {
        "user_password"
    }

    fn apply(&self, _info: &ServerInfo, connect: &mut ConnectInfo) -> Result<()> {
        connect.user = Some(self.user.clone());
        connect.pass.clone_from(&self.pass);
        Ok(())
    }
}

#[derive(Clone)]
pub struct TokenAuth {
    pub token: String,
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenAuth(<redacted>)")
    }
}

impl Authenticator for TokenAuth {
    fn method(&self) -> &'static str {
        "token"
    }

    fn apply(&self, _info: &ServerInfo, connect: &mut ConnectInfo) -> Result<()> {
        connect.auth_token = Some(self.token.clone());
        Ok(())
    }
}

/// URL-safe base64 without padding, the form servers expect for nonce
/// signatures.
pub fn encode_signature(signature: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(signature)
}

fn sign_nonce(signer: &dyn NonceSigner, info: &ServerInfo) -> Result<Option<String>> {
    match info.nonce.as_deref() {
        Some(nonce) => {
            let signature = signer.sign(nonce.as_bytes())?;
            Ok(Some(encode_signature(&signature)))
        }
        None => Ok(None),
    }
}

/// Public nkey plus a signer for its private half.
#[derive(Clone)]
pub struct NkeyAuth {
    pub public_key: String,
    pub signer: Arc<dyn NonceSigner>,
}

impl fmt::Debug for NkeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NkeyAuth")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Authenticator for NkeyAuth {
    fn method(&self) -> &'static str {
        "nkey"
    }

    fn signs_nonce(&self) -> bool {
        true
    }

    fn apply(&self, info: &ServerInfo, connect: &mut ConnectInfo) -> Result<()> {
        connect.nkey = Some(self.public_key.clone());
        connect.sig = sign_nonce(self.signer.as_ref(), info)?;
        Ok(())
    }
}

/// User JWT, static or produced per connect, plus a nonce signer.
#[derive(Clone)]
pub struct UserJwtAuth {
    pub jwt: JwtSource,
    pub signer: Arc<dyn NonceSigner>,
}

impl fmt::Debug for UserJwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserJwtAuth")
            .field("jwt", &self.jwt)
            .finish_non_exhaustive()
    }
}

impl Authenticator for UserJwtAuth {
    fn method(&self) -> &'static str {
        "user_jwt"
    }

    fn signs_nonce(&self) -> bool {
        true
    }

    fn apply(&self, info: &ServerInfo, connect: &mut ConnectInfo) -> Result<()> {
        connect.jwt = Some(self.jwt.resolve()?);
        connect.sig = sign_nonce(self.signer.as_ref(), info)?;
        Ok(())
    }
}

/// Raw credential inputs as configured, before a variant is chosen.
#[derive(Clone, Default)]
pub struct CredentialInputs {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub nkey: Option<String>,
    pub user_jwt: Option<JwtSource>,
    pub nonce_signer: Option<Arc<dyn NonceSigner>>,
}

impl CredentialInputs {
    /// Chooses the single active variant. Signer and identity must be
    /// supplied together.
    pub fn resolve(&self) -> Result<Arc<dyn Authenticator>> {
        let has_identity = self.nkey.is_some() || self.user_jwt.is_some();
        match (&self.nonce_signer, has_identity) {
            (Some(_), false) => return Err(NatsError::SignerWithoutIdentity),
            (None, true) => return Err(NatsError::IdentityWithoutSigner),
            _ => {}
        }

        if let Some(signer) = &self.nonce_signer {
            if let Some(jwt) = &self.user_jwt {
                return Ok(Arc::new(UserJwtAuth {
                    jwt: jwt.clone(),
                    signer: Arc::clone(signer),
                }));
            }
            if let Some(nkey) = &self.nkey {
                return Ok(Arc::new(NkeyAuth {
                    public_key: nkey.clone(),
                    signer: Arc::clone(signer),
                }));
            }
        }
        if let Some(token) = &self.token {
            return Ok(Arc::new(TokenAuth {
                token: token.clone(),
            }));
        }
        if let Some(user) = &self.user {
            return Ok(Arc::new(UserPasswordAuth {
                user: user.clone(),
                pass: self.pass.clone(),
            }));
        }
        Ok(Arc::new(NoAuth))
    }
}

impl fmt::Debug for CredentialInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialInputs")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("nkey", &self.nkey)
            .field("user_jwt", &self.user_jwt)
            .field("nonce_signer", &self.nonce_signer.is_some())
            .finish()
    }
}
