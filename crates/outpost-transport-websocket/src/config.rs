//! WebSocket connector configuration

use outpost_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Proxy schemes the connector knows how to dial through
pub const SUPPORTED_PROXY_SCHEMES: &[&str] = &["http", "socks", "socks5", "socks5h"];

/// Client-side WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Basic auth credentials as `user:password`
    pub auth: Option<String>,

    /// Extra headers sent with the upgrade request
    pub headers: Vec<(String, String)>,

    /// Override for the `Host` header
    pub host_header: Option<String>,

    pub user_agent: String,

    /// Optional HTTP CONNECT or SOCKS5 proxy
    pub proxy: Option<Url>,

    /// Expected prefix of the server fingerprint
    pub fingerprint: Option<String>,

    /// Bound on dial + upgrade + HELLO
    pub handshake_timeout: Duration,

    /// PEM bundle used instead of the webpki roots
    pub root_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    pub insecure: bool,

    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

impl WebSocketConfig {
    pub fn client_default() -> Self {
        Self {
            auth: None,
            headers: Vec::new(),
            host_header: None,
            user_agent: format!("outpost/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            fingerprint: None,
            handshake_timeout: Duration::from_secs(30),
            root_cert: None,
            insecure: false,
            max_message_size: 16 * 1024 * 1024,
        }
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the proxy from a URL string such as `socks5://user:pw@10.0.0.1:1080`
    pub fn with_proxy(mut self, proxy: &str) -> TransportResult<Self> {
        let url = Url::parse(proxy).map_err(|e| {
            TransportError::UnsupportedProxy(format!("invalid proxy URL '{}': {}", proxy, e))
        })?;
        self.proxy = Some(url);
        Ok(self)
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if let Some(proxy) = &self.proxy {
            if !SUPPORTED_PROXY_SCHEMES.contains(&proxy.scheme()) {
                return Err(TransportError::UnsupportedProxy(proxy.scheme().to_string()));
            }
            if proxy.host_str().is_none() {
                return Err(TransportError::UnsupportedProxy(format!(
                    "proxy URL '{}' has no host",
                    proxy
                )));
            }
        }
        if let Some(auth) = &self.auth {
            if !auth.contains(':') {
                return Err(TransportError::Handshake(
                    "auth must be given as user:password".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build rustls TlsConnector for wss:// servers
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        match &self.root_cert {
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        TransportError::Handshake(format!("Invalid root cert: {}", e))
                    })?;
                }
            }
        }

        let client_crypto = if self.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
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

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Handshake(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Handshake(format!("Failed to parse certs: {}", e)))
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = WebSocketConfig::client_default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("outpost/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_scheme_validation() {
        let socks = WebSocketConfig::client_default()
            .with_proxy("socks5h://user:pw@10.0.0.1:1080")
            .unwrap();
        assert!(socks.validate().is_ok());

        let socks4 = WebSocketConfig::client_default()
            .with_proxy("socks4://10.0.0.1:1080")
            .unwrap();
        assert!(matches!(
            socks4.validate(),
            Err(TransportError::UnsupportedProxy(scheme)) if scheme == "socks4"
        ));
    }

    #[test]
    fn test_auth_requires_password() {
        let config = WebSocketConfig::client_default().with_auth("just-a-user");
        assert!(config.validate().is_err());
        let config = WebSocketConfig::client_default().with_auth("client1:secret");
        assert!(config.validate().is_ok());
    }
}
