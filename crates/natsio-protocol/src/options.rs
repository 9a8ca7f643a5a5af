//! Connection options: typed builder plus the camelCase option bag accepted
//! by [`ConnectOptions::from_value`].

use crate::auth::{Authenticator, CredentialInputs, JwtSource, NonceSigner};
use crate::connection::ReconnectConfig;
use crate::error::{NatsError, Result};
use crate::flow_control::YieldPolicy;
use crate::inbox::INBOX_PREFIX;
use crate::outbound::DEFAULT_RECONNECT_BUFFER_SIZE;
use crate::server_pool::DEFAULT_URL;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PINGS_OUT: u32 = 2;

/// Text encoding applied to payloads when the JSON codec is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    /// One byte per code point; also accepted as `binary`.
    Latin1,
}

impl Encoding {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Ascii => "ascii",
            Self::Latin1 => "latin1",
        }
    }
}

impl FromStr for Encoding {
    type Err = NatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "ascii" => Ok(Self::Ascii),
            "latin1" | "binary" => Ok(Self::Latin1),
            _ => Err(NatsError::InvalidEncoding(s.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub servers: Vec<String>,
    /// Keep discovered servers in gossip order.
    pub no_randomize: bool,
    /// Shuffle the configured servers too.
    pub randomize_configured: bool,
    pub name: Option<String>,
    pub verbose: bool,
    pub pedantic: bool,
    pub no_echo: bool,
    pub use_old_request_style: bool,
    pub reconnect: ReconnectConfig,
    pub reconnect_buffer_size: usize,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub max_pings_out: u32,
    pub tls_required: bool,
    pub encoding: Encoding,
    pub json: bool,
    pub yield_policy: YieldPolicy,
    pub wait_on_first_connect: bool,
    pub inbox_prefix: String,
    pub credentials: CredentialInputs,
    /// Credentials file holding a user JWT and nkey seed.
    pub user_creds: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_URL.to_string()],
            no_randomize: false,
            randomize_configured: false,
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            use_old_request_style: false,
            reconnect: ReconnectConfig::default(),
            reconnect_buffer_size: DEFAULT_RECONNECT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            tls_required: false,
            encoding: Encoding::Utf8,
            json: false,
            yield_policy: YieldPolicy::never(),
            wait_on_first_connect: false,
            inbox_prefix: INBOX_PREFIX.to_string(),
            credentials: CredentialInputs::default(),
            user_creds: None,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("servers", &self.servers)
            .field("no_randomize", &self.no_randomize)
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("no_echo", &self.no_echo)
            .field("use_old_request_style", &self.use_old_request_style)
            .field("reconnect", &self.reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("tls_required", &self.tls_required)
            .field("encoding", &self.encoding)
            .field("json", &self.json)
            .field("credentials", &self.credentials)
            .field("user_creds", &self.user_creds)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            servers: vec![url.into()],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn with_pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    #[must_use]
    pub fn with_no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    #[must_use]
    pub fn with_no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    #[must_use]
    pub fn with_randomize_configured(mut self, randomize: bool) -> Self {
        self.randomize_configured = randomize;
        self
    }

    #[must_use]
    pub fn with_old_request_style(mut self, enabled: bool) -> Self {
        self.use_old_request_style = enabled;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect.wait = wait;
        self
    }

    #[must_use]
    pub fn with_reconnect_jitter(mut self, jitter: Duration, jitter_tls: Duration) -> Self {
        self.reconnect.jitter = jitter;
        self.reconnect.jitter_tls = jitter_tls;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.reconnect.delay_handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.reconnect_buffer_size = bytes;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    #[must_use]
    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    #[must_use]
    pub fn with_yield_policy(mut self, policy: YieldPolicy) -> Self {
        self.yield_policy = policy;
        self
    }

    #[must_use]
    pub fn with_wait_on_first_connect(mut self, wait: bool) -> Self {
        self.wait_on_first_connect = wait;
        self
    }

    #[must_use]
    pub fn with_inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_user_password(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.credentials.user = Some(user.into());
        self.credentials.pass = Some(pass.into());
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_nkey(mut self, public_key: impl Into<String>) -> Self {
        self.credentials.nkey = Some(public_key.into());
        self
    }

    #[must_use]
    pub fn with_user_jwt(mut self, jwt: JwtSource) -> Self {
        self.credentials.user_jwt = Some(jwt);
        self
    }

    #[must_use]
    pub fn with_nonce_signer(mut self, signer: Arc<dyn NonceSigner>) -> Self {
        self.credentials.nonce_signer = Some(signer);
        self
    }

    #[must_use]
    pub fn with_user_creds(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_creds = Some(path.into());
        self
    }

    /// Resolves the active credential variant. Raised before any I/O.
    pub fn authenticator(&self) -> Result<Arc<dyn Authenticator>> {
        self.credentials.resolve()
    }

    /// Checks the options for configuration errors without connecting.
    pub fn validate(&self) -> Result<()> {
        if self.user_creds.is_none() {
            self.authenticator()?;
        }
        if self.inbox_prefix.is_empty() {
            return Err(NatsError::BadOptions("inbox prefix must not be empty".into()));
        }
        Ok(())
    }

    /// Parses the camelCase option bag. Errors are configuration errors and
    /// are returned synchronously.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(NatsError::BadOptions("options must be an object".into()));
        }
        let raw: RawOptions = serde_json::from_value(value.clone())
            .map_err(|e| NatsError::BadOptions(e.to_string()))?;
        raw.into_options()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawOptions {
    url: Option<String>,
    servers: Option<Vec<String>>,
    port: Option<u16>,
    verbose: Option<bool>,
    pedantic: Option<bool>,
    reconnect: Option<bool>,
    max_reconnect_attempts: Option<i64>,
    reconnect_time_wait: Option<u64>,
    reconnect_jitter: Option<u64>,
    #[serde(rename = "reconnectJitterTLS")]
    reconnect_jitter_tls: Option<u64>,
    no_randomize: Option<bool>,
    no_echo: Option<bool>,
    use_old_request_style: Option<bool>,
    name: Option<String>,
    timeout: Option<Value>,
    encoding: Option<String>,
    json: Option<bool>,
    user: Option<String>,
    pass: Option<String>,
    token: Option<String>,
    tls: Option<Value>,
    ping_interval: Option<u64>,
    max_ping_out: Option<u32>,
    yield_time: Option<u64>,
    wait_on_first_connect: Option<bool>,
    user_creds: Option<String>,
}

impl RawOptions {
    fn into_options(self) -> Result<ConnectOptions> {
        let mut opts = ConnectOptions::default();

        if let Some(timeout) = self.timeout {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ms = timeout
                .as_u64()
                .or_else(|| {
                    timeout
                        .as_f64()
                        .filter(|ms| ms.is_finite() && *ms >= 0.0)
                        .map(|ms| ms as u64)
                })
                .ok_or_else(|| NatsError::BadOptions("timeout should be a number".into()))?;
            opts.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(encoding) = self.encoding {
            opts.encoding = encoding.parse()?;
        }

        if let Some(servers) = self.servers.filter(|s| !s.is_empty()) {
            opts.servers = servers;
        } else if let Some(url) = self.url {
            opts.servers = vec![url];
        } else if let Some(port) = self.port {
            opts.servers = vec![format!("nats://localhost:{port}")];
        }

        opts.verbose = self.verbose.unwrap_or(opts.verbose);
        opts.pedantic = self.pedantic.unwrap_or(opts.pedantic);
        opts.reconnect.enabled = self.reconnect.unwrap_or(opts.reconnect.enabled);
        if let Some(attempts) = self.max_reconnect_attempts {
            opts.reconnect.max_attempts = u32::try_from(attempts).ok();
        }
        if let Some(ms) = self.reconnect_time_wait {
            opts.reconnect.wait = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_jitter {
            opts.reconnect.jitter = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_jitter_tls {
            opts.reconnect.jitter_tls = Duration::from_millis(ms);
        }
        opts.no_randomize = self.no_randomize.unwrap_or(opts.no_randomize);
        opts.no_echo = self.no_echo.unwrap_or(opts.no_echo);
        opts.use_old_request_style = self
            .use_old_request_style
            .unwrap_or(opts.use_old_request_style);
        opts.name = self.name;
        opts.json = self.json.unwrap_or(opts.json);
        opts.credentials.user = self.user;
        opts.credentials.pass = self.pass;
        opts.credentials.token = self.token;
        opts.tls_required = match self.tls {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(Value::Bool(true) | Value::Object(_)) => true,
            Some(_) => {
                return Err(NatsError::BadOptions(
                    "tls should be a boolean or an object".into(),
                ))
            }
        };
        if let Some(ms) = self.ping_interval {
            opts.ping_interval = Duration::from_millis(ms);
        }
        opts.max_pings_out = self.max_ping_out.unwrap_or(opts.max_pings_out);
        if let Some(ms) = self.yield_time {
            opts.yield_policy = YieldPolicy::every_duration(Duration::from_millis(ms));
        }
        opts.wait_on_first_connect = self
            .wait_on_first_connect
            .unwrap_or(opts.wait_on_first_connect);
        opts.user_creds = self.user_creds.map(PathBuf::from);

        Ok(opts)
    }
}
