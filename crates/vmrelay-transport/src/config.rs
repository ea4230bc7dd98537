//! Relay client configuration

use crate::error::{TransportError, TransportResult};
use std::sync::Arc;
use std::time::Duration;

/// How the connection to the relay endpoint is secured.
#[derive(Debug, Clone)]
pub enum TransportSecurity {
    /// TLS with the webpki root store (or verification skipped for
    /// development against self-signed relays).
    Tls {
        verify_server_cert: bool,
        /// SNI override; defaults to the endpoint hostname.
        server_name: Option<String>,
    },
    /// Plain TCP. Only meaningful for loopback test relays.
    Plaintext,
}

/// Configuration for [`crate::RelayConnector`].
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Relay endpoint, `host:port` or `relay://host:port`.
    pub endpoint: String,

    /// Security configuration
    pub security: TransportSecurity,

    /// Window for connect + handshake combined
    pub handshake_timeout: Duration,

    /// Window for opening one logical stream
    pub stream_open_timeout: Duration,
}

impl RelayClientConfig {
    /// Create a client configuration with defaults (verified TLS).
    pub fn client_default(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            security: TransportSecurity::Tls {
                verify_server_cert: true,
                server_name: None,
            },
            handshake_timeout: Duration::from_secs(10),
            stream_open_timeout: Duration::from_secs(10),
        }
    }

    /// Create a client configuration for local development (skip cert verification)
    pub fn client_insecure(endpoint: impl Into<String>) -> Self {
        let mut config = Self::client_default(endpoint);
        config.security = TransportSecurity::Tls {
            verify_server_cert: false,
            server_name: None,
        };
        config
    }

    /// Create a plaintext configuration for in-process test relays.
    pub fn plaintext(endpoint: impl Into<String>) -> Self {
        let mut config = Self::client_default(endpoint);
        config.security = TransportSecurity::Plaintext;
        config
    }

    /// Set custom handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set custom stream-open timeout
    pub fn with_stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.stream_open_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.endpoint.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Relay endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for the client, if TLS is configured.
    pub(crate) fn build_tls_connector(&self) -> TransportResult<Option<tokio_rustls::TlsConnector>> {
        let verify = match &self.security {
            TransportSecurity::Plaintext => return Ok(None),
            TransportSecurity::Tls {
                verify_server_cert, ..
            } => *verify_server_cert,
        };

        ensure_crypto_provider();

        let client_crypto = if verify {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(Some(tokio_rustls::TlsConnector::from(Arc::new(
            client_crypto,
        ))))
    }

    /// SNI name to present, given the resolved endpoint hostname.
    pub(crate) fn sni_name(&self, hostname: &str) -> String {
        match &self.security {
            TransportSecurity::Tls {
                server_name: Some(name),
                ..
            } => name.clone(),
            _ => hostname.to_string(),
        }
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
