//! STARTTLS upgrade of an established TCP stream

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ConnectError;

/// Connector trusting the platform's native root certificates
pub fn native_connector() -> Result<TlsConnector, ConnectError> {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!("Skipping unreadable native certificate: {}", error);
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    if roots.is_empty() {
        return Err(ConnectError::Tls(
            "no trusted root certificates available".to_string(),
        ));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over `stream`, verifying the certificate for `host`
pub async fn upgrade(stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, ConnectError> {
    let connector = native_connector()?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ConnectError::Tls(format!("invalid server name {host}: {e}")))?;
    connector
        .connect(name, stream)
        .await
        .map_err(|e| ConnectError::Tls(e.to_string()))
}
