use thiserror::Error;

pub type Result<T> = std::result::Result<T, NatsError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatsError {
    #[error("Bad options: {0}")]
    BadOptions(String),

    #[error("Invalid Encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("Invalid queue group: {0:?}")]
    InvalidQueueGroup(String),

    #[error("Message should be a JSON object")]
    InvalidJsonPayload,

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Authorization violation: {0}")]
    AuthorizationViolation(String),

    #[error("User authentication expired")]
    AuthenticationExpired,

    #[error("Permissions violation: {0}")]
    PermissionViolation(String),

    #[error("Stale connection")]
    StaleConnection,

    #[error("Server requires a secure connection")]
    SecureConnRequired,

    #[error("Server does not support a secure connection")]
    NonSecureConnRequired,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Server does not support no_echo")]
    NoEchoNotSupported,

    #[error("Server requires an nkey signature")]
    NonceSignerRequired,

    #[error("Nonce signer needs an nkey or user JWT to sign for")]
    SignerWithoutIdentity,

    #[error("Nkey or user JWT needs a nonce signer")]
    IdentityWithoutSigner,

    #[error("Invalid nkey: {0}")]
    InvalidNkey(String),

    #[error("Invalid credentials file: {0}")]
    CredsFile(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection draining")]
    ConnectionDraining,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Subscription {0} is already draining")]
    SubscriptionDraining(u64),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Connection timed out")]
    Timeout,

    #[error("Maximum payload exceeded: size {size} exceeds maximum {max}")]
    MaxPayloadExceeded { size: usize, max: usize },

    #[error("Reconnect buffer exceeded: {size} pending bytes exceeds maximum {max}")]
    ReconnectBufferExceeded { size: usize, max: usize },

    #[error("No servers available for connection")]
    NoServersAvailable,
}

impl NatsError {
    /// Maps the text of a server `-ERR` line to a typed error.
    pub fn from_server_error(text: &str) -> Self {
        let trimmed = text.trim().trim_matches('\'').trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("permissions violation") {
            Self::PermissionViolation(trimmed.to_string())
        } else if lower.contains("authorization violation") {
            Self::AuthorizationViolation(trimmed.to_string())
        } else if lower.contains("authentication expired") {
            Self::AuthenticationExpired
        } else if lower.contains("stale connection") {
            Self::StaleConnection
        } else if lower.contains("secure connection - tls required") {
            Self::SecureConnRequired
        } else {
            Self::ServerError(trimmed.to_string())
        }
    }
}

impl From<std::io::Error> for NatsError {
    fn from(err: std::io::Error) -> Self {
        NatsError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NatsError {
    fn from(err: serde_json::Error) -> Self {
        NatsError::Encoding(err.to_string())
    }
}

impl From<url::ParseError> for NatsError {
    fn from(err: url::ParseError) -> Self {
        NatsError::BadOptions(format!("invalid server url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NatsError::BadOptions("timeout should be a number".to_string());
        assert_eq!(err.to_string(), "Bad options: timeout should be a number");

        let err = NatsError::InvalidEncoding("foobar".to_string());
        assert!(err.to_string().contains("Invalid Encoding"));

        let err = NatsError::NonceSignerRequired;
        assert!(err.to_string().contains("requires an nkey signature"));

        let err = NatsError::IdentityWithoutSigner;
        assert!(err.to_string().contains("needs a nonce signer"));
    }

    #[test]
    fn test_server_error_mapping() {
        assert!(matches!(
            NatsError::from_server_error("'Permissions Violation for Publish to \"foo\"'"),
            NatsError::PermissionViolation(ref s) if s == "Permissions Violation for Publish to \"foo\""
        ));
        assert!(matches!(
            NatsError::from_server_error("'Authorization Violation'"),
            NatsError::AuthorizationViolation(_)
        ));
        assert_eq!(
            NatsError::from_server_error("'Stale Connection'"),
            NatsError::StaleConnection
        );
        assert_eq!(
            NatsError::from_server_error("'Secure Connection - TLS Required'"),
            NatsError::SecureConnRequired
        );
        assert_eq!(
            NatsError::from_server_error("'User Authentication Expired'"),
            NatsError::AuthenticationExpired
        );
        assert!(matches!(
            NatsError::from_server_error("'Unknown Protocol Operation'"),
            NatsError::ServerError(ref s) if s == "Unknown Protocol Operation"
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: NatsError = io_err.into();
        assert!(matches!(err, NatsError::Io(_)));
    }
}
