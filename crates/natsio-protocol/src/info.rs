use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const LANG: &str = "rust";

/// Body of the server's `INFO` frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub version: String,
    /// Protocol level. `1` or higher supports `echo: false`.
    pub proto: i32,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<usize>,
    pub auth_required: bool,
    pub tls_required: bool,
    pub tls_verify: bool,
    pub tls_available: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
}

impl ServerInfo {
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD)
    }

    #[must_use]
    pub fn supports_no_echo(&self) -> bool {
        self.proto >= 1
    }
}

/// Body of the client's `CONNECT` frame.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub protocol: i32,
    pub version: String,
    pub lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    pub tls_required: bool,
}

impl std::fmt::Debug for ConnectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectInfo")
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("lang", &self.lang)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("nkey", &self.nkey)
            .field("jwt", &self.jwt.as_ref().map(|_| "<redacted>"))
            .field("sig", &self.sig.is_some())
            .field("echo", &self.echo)
            .field("tls_required", &self.tls_required)
            .finish()
    }
}
