use crate::error::{NatsError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Certificate material for the TLS upgrade that follows `INFO`.
pub struct TlsConfig {
    pub root_certs: Option<Vec<CertificateDer<'static>>>,
    pub use_system_roots: bool,
    pub client_cert: Option<Vec<CertificateDer<'static>>>,
    pub client_key: Option<PrivateKeyDer<'static>>,
    pub verify_server_cert: bool,
    /// Overrides the host name used for certificate verification.
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            root_certs: None,
            use_system_roots: true,
            client_cert: None,
            client_key: None,
            verify_server_cert: true,
            server_name: None,
        }
    }
}

impl Clone for TlsConfig {
    fn clone(&self) -> Self {
        Self {
            root_certs: self.root_certs.clone(),
            use_system_roots: self.use_system_roots,
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.as_ref().map(PrivateKeyDer::clone_key),
            verify_server_cert: self.verify_server_cert,
            server_name: self.server_name.clone(),
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("root_certs", &self.root_certs.as_ref().map(Vec::len))
            .field("use_system_roots", &self.use_system_roots)
            .field("client_cert", &self.client_cert.is_some())
            .field("verify_server_cert", &self.verify_server_cert)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_root_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.root_certs = Some(certs);
        self.use_system_roots = false;
        self
    }

    #[must_use]
    pub fn with_client_cert(
        mut self,
        cert: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.client_cert = Some(cert);
        self.client_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_verify_server_cert(mut self, verify: bool) -> Self {
        self.verify_server_cert = verify;
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut root_store = RootCertStore::empty();
        if self.use_system_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(certs) = &self.root_certs {
            for cert in certs {
                root_store
                    .add(cert.clone())
                    .map_err(|e| NatsError::Tls(format!("failed to add root cert: {e}")))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NatsError::Tls(format!("failed to set protocol versions: {e}")))?;

        let mut config = match (&self.client_cert, &self.client_key) {
            (Some(chain), Some(key)) => builder
                .with_root_certificates(root_store)
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| NatsError::Tls(format!("failed to configure client cert: {e}")))?,
            _ => builder
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        };

        if !self.verify_server_cert {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoVerification));
        }
        Ok(Arc::new(config))
    }

    /// Runs the TLS handshake over an open TCP stream.
    pub async fn upgrade(&self, stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.build_client_config()?);
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| NatsError::Tls(format!("invalid server name: {e}")))?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| NatsError::Tls(e.to_string()))?;
        tracing::debug!(host, "TLS handshake completed");
        Ok(stream)
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let config = TlsConfig::default().build_client_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_insecure_config_builds() {
        let tls = TlsConfig::new()
            .with_root_certs(Vec::new())
            .with_verify_server_cert(false);
        assert!(!tls.use_system_roots);
        assert!(tls.build_client_config().is_ok());
    }

    #[test]
    fn test_clone_keeps_settings() {
        let tls = TlsConfig::new().with_server_name("nats.example.com");
        let cloned = tls.clone();
        assert_eq!(cloned.server_name.as_deref(), Some("nats.example.com"));
        assert!(cloned.verify_server_cert);
    }
}
