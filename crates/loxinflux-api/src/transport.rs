// HTTP client and endpoint addressing for one Miniserver.
//
// Miniservers answer on plain HTTP (port 80) or, on Gen 2 hardware, on
// HTTPS (port 443) with a certificate that rarely matches a LAN address.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::Connector;
use url::Url;

use crate::error::Error;

const WEBSOCKET_PATH: &str = "ws/rfc6455";

/// TLS verification mode for the HTTP bootstrap and the WebSocket upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Use the bundled root certificates.
    System,
    /// Accept any certificate (for self-signed Miniservers).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::DangerAcceptInvalid,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("loxinflux/", env!("CARGO_PKG_VERSION")));

        if self.tls == TlsMode::DangerAcceptInvalid {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Connector for the WebSocket upgrade to `url`, verifying the
    /// certificate the same way as the HTTP client.
    pub fn websocket_connector(&self, url: &Url) -> Result<Connector, Error> {
        if url.scheme() != "wss" {
            return Ok(Connector::Plain);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = self.certificate_verifier(&provider)?;
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("failed to build TLS config: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        Ok(Connector::Rustls(Arc::new(config)))
    }

    fn certificate_verifier(
        &self,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Arc<dyn ServerCertVerifier>, Error> {
        match self.tls {
            TlsMode::DangerAcceptInvalid => Ok(Arc::new(AcceptAnyCertificate {
                algorithms: provider.signature_verification_algorithms,
            })),
            TlsMode::System => {
                let roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                let verifier =
                    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
                        .build()
                        .map_err(|e| Error::Tls(format!("failed to build certificate verifier: {e}")))?;
                Ok(verifier)
            }
        }
    }
}

/// Skips certificate validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Base URL for a Miniserver; port 443 selects HTTPS.
pub fn base_url(host: &str, port: u16) -> Result<Url, Error> {
    let url = match port {
        443 => format!("https://{host}/"),
        80 => format!("http://{host}/"),
        _ => format!("http://{host}:{port}/"),
    };
    Ok(Url::parse(&url)?)
}

/// WebSocket endpoint matching an HTTP(S) base URL.
pub fn websocket_url(base: &Url) -> Result<Url, Error> {
    let mut url = base.join(WEBSOCKET_PATH)?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocketConnect(format!("cannot derive websocket url from {base}")))?;
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_url_picks_scheme_from_port() {
        assert_eq!(base_url("10.0.0.5", 80).unwrap().as_str(), "http://10.0.0.5/");
        assert_eq!(base_url("ms.local", 443).unwrap().as_str(), "https://ms.local/");
        assert_eq!(
            base_url("10.0.0.5", 8080).unwrap().as_str(),
            "http://10.0.0.5:8080/"
        );
    }

    #[test]
    fn websocket_url_follows_tls() {
        let plain = websocket_url(&base_url("10.0.0.5", 8080).unwrap()).unwrap();
        assert_eq!(plain.as_str(), "ws://10.0.0.5:8080/ws/rfc6455");

        let tls = websocket_url(&base_url("ms.local", 443).unwrap()).unwrap();
        assert_eq!(tls.as_str(), "wss://ms.local/ws/rfc6455");
    }

    #[test]
    fn client_builds_with_both_tls_modes() {
        let mut config = TransportConfig::default();
        assert!(config.build_client().is_ok());
        config.tls = TlsMode::System;
        assert!(config.build_client().is_ok());
    }

    #[test]
    fn plain_websocket_needs_no_tls() {
        let url = websocket_url(&base_url("10.0.0.5", 80).unwrap()).unwrap();
        let connector = TransportConfig::default().websocket_connector(&url).unwrap();
        assert!(matches!(connector, Connector::Plain));
    }

    #[test]
    fn secure_websocket_uses_rustls_in_both_modes() {
        let url = websocket_url(&base_url("ms.local", 443).unwrap()).unwrap();
        let mut config = TransportConfig::default();
        assert!(matches!(config.websocket_connector(&url).unwrap(), Connector::Rustls(_)));
        config.tls = TlsMode::System;
        assert!(matches!(config.websocket_connector(&url).unwrap(), Connector::Rustls(_)));
    }

    #[test]
    fn certificate_check_follows_tls_mode() {
        // Not a certificate at all; only the accepting verifier lets it through.
        let bogus = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let name = ServerName::try_from("192.168.1.77").unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verify = |tls| {
            TransportConfig {
                tls,
                ..TransportConfig::default()
            }
            .certificate_verifier(&provider)
            .unwrap()
            .verify_server_cert(&bogus, &[], &name, &[], UnixTime::now())
        };

        assert!(verify(TlsMode::DangerAcceptInvalid).is_ok());
        assert!(verify(TlsMode::System).is_err());
    }
}
