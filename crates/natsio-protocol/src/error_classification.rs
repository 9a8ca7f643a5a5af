use crate::error::NatsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Rejected synchronously at the call site, before any I/O.
    Configuration,
    /// Ends the connection and is reported through the error notification.
    Fatal,
    /// A single publish or subscribe was denied; the connection stays usable.
    Permission,
    /// Per-call failure caused by connection or subscription state.
    Operational,
    /// No reply within the deadline.
    Timeout,
}

impl NatsError {
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::BadOptions(_)
            | Self::InvalidEncoding(_)
            | Self::InvalidSubject(_)
            | Self::InvalidQueueGroup(_)
            | Self::InvalidJsonPayload
            | Self::Encoding(_)
            | Self::SignerWithoutIdentity
            | Self::IdentityWithoutSigner
            | Self::InvalidNkey(_)
            | Self::CredsFile(_)
            | Self::MaxPayloadExceeded { .. } => ErrorClass::Configuration,
            Self::PermissionViolation(_) => ErrorClass::Permission,
            Self::ConnectionClosed
            | Self::ConnectionDraining
            | Self::InvalidState(_)
            | Self::UnknownSubscription(_)
            | Self::SubscriptionDraining(_)
            | Self::ReconnectBufferExceeded { .. } => ErrorClass::Operational,
            Self::RequestTimeout => ErrorClass::Timeout,
            Self::Io(_)
            | Self::ProtocolError(_)
            | Self::ServerError(_)
            | Self::AuthorizationViolation(_)
            | Self::AuthenticationExpired
            | Self::StaleConnection
            | Self::SecureConnRequired
            | Self::NonSecureConnRequired
            | Self::Tls(_)
            | Self::NoEchoNotSupported
            | Self::NonceSignerRequired
            | Self::Timeout
            | Self::NoServersAvailable => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Fatal
    }

    #[must_use]
    pub fn is_permission(&self) -> bool {
        self.classify() == ErrorClass::Permission
    }

    /// Transport-level failures that send a live connection into the
    /// reconnect rotation instead of closing it.
    #[must_use]
    pub fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StaleConnection | Self::Timeout | Self::ProtocolError(_)
        )
    }

    /// Fatal errors that mean the server refused this client outright, such
    /// as a TLS mismatch or rejected credentials. Retrying cannot succeed,
    /// so a handshake ending this way closes the client.
    #[must_use]
    pub fn rejects_handshake(&self) -> bool {
        self.is_fatal() && !self.triggers_reconnect()
    }
}
