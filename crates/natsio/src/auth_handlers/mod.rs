//! Credential resolution that needs the client's I/O or crypto stack.

pub mod creds;
pub mod nkey;

pub use creds::{load_creds, parse_creds, Credentials};
pub use nkey::KeyPair;

use crate::error::Result;
use natsio_protocol::{Authenticator, ConnectOptions, JwtSource, UserJwtAuth};
use std::sync::Arc;

/// Resolves the active credential variant. A credentials file takes
/// precedence and yields a user JWT signed with its seed.
pub async fn resolve_authenticator(options: &ConnectOptions) -> Result<Arc<dyn Authenticator>> {
    let Some(path) = &options.user_creds else {
        return options.authenticator();
    };
    let creds = load_creds(path).await?;
    let key_pair = KeyPair::from_seed(&creds.seed)?;
    tracing::debug!(public_key = key_pair.public_key(), "loaded credentials file");
    Ok(Arc::new(UserJwtAuth {
        jwt: JwtSource::Static(creds.jwt),
        signer: Arc::new(key_pair),
    }))
}

/// Nkey authentication from a seed string.
pub fn nkey_from_seed(options: ConnectOptions, seed: &str) -> Result<ConnectOptions> {
    let key_pair = KeyPair::from_seed(seed)?;
    let public_key = key_pair.public_key().to_string();
    Ok(options
        .with_nkey(public_key)
        .with_nonce_signer(Arc::new(key_pair)))
}
