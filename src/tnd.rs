//! Trusted network detection.
//!
//! Probes the profile's trusted HTTPS servers and compares the
//! presented certificate against a pinned SHA-256 hash. Matching any
//! server means the host is on a trusted network. Probe sockets carry
//! the split-routing firewall mark so they escape the always-on
//! firewall.

use sha2::{Digest, Sha256};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TndError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not resolve probe server {0}")]
    Resolve(String),
    #[error("Invalid probe server name: {0}")]
    ServerName(String),
}

/// A trusted HTTPS probe server with its pinned certificate hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TndServer {
    pub url: String,
    pub hash: String,
}

impl TndServer {
    pub fn new(url: String, hash: String) -> Self {
        Self { url, hash }
    }

    /// Host and port of the probe URL.
    fn host_port(&self) -> (String, u16) {
        let rest = self.url.strip_prefix("https://").unwrap_or(&self.url);
        let rest = rest.split('/').next().unwrap_or(rest);
        match rest.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
            None => (rest.to_string(), 443),
        }
    }
}

/// Trusted network detector handle.
pub struct Tnd {
    handle: JoinHandle<()>,
}

impl Tnd {
    /// Start probing; a verdict is sent after every probe round.
    pub fn start(servers: Vec<TndServer>, fwmark: u32, results_tx: mpsc::Sender<bool>) -> Self {
        let handle = tokio::spawn(run(servers, fwmark, results_tx));
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run(servers: Vec<TndServer>, fwmark: u32, results_tx: mpsc::Sender<bool>) {
    let mut ticker = interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let trusted = probe_all(&servers, fwmark).await;
        if results_tx.send(trusted).await.is_err() {
            return;
        }
    }
}

async fn probe_all(servers: &[TndServer], fwmark: u32) -> bool {
    for server in servers {
        match timeout(PROBE_TIMEOUT, probe(server, fwmark)).await {
            Ok(Ok(true)) => {
                debug!(url = %server.url, "TND probe matched pinned certificate");
                return true;
            }
            Ok(Ok(false)) => debug!(url = %server.url, "TND probe certificate mismatch"),
            Ok(Err(e)) => debug!(url = %server.url, error = %e, "TND probe failed"),
            Err(_) => debug!(url = %server.url, "TND probe timed out"),
        }
    }
    false
}

async fn probe(server: &TndServer, fwmark: u32) -> Result<bool, TndError> {
    let (host, port) = server.host_port();
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| TndError::Resolve(host.clone()))?;

    let stream = connect_marked(addr, fwmark).await?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CaptureCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| TndError::ServerName(host.clone()))?;

    let tls = connector.connect(server_name, stream).await?;
    let (_, conn) = tls.get_ref();

    let Some(certs) = conn.peer_certificates() else {
        return Ok(false);
    };
    let Some(cert) = certs.first() else {
        return Ok(false);
    };

    let hash = hex(&Sha256::digest(cert.as_ref()));
    Ok(hash.eq_ignore_ascii_case(&server.hash))
}

/// Connect with the split-routing firewall mark set on the socket.
async fn connect_marked(addr: SocketAddr, fwmark: u32) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Err(e) = socket2::SockRef::from(&socket).set_mark(fwmark) {
        warn!(error = %e, "TND could not set fwmark on probe socket");
    }
    socket.connect(addr).await
}

/// Accepts any certificate chain; validation happens by hash comparison
/// against the profile's pinned value after the handshake.
#[derive(Debug)]
struct CaptureCert;

impl rustls::client::danger::ServerCertVerifier for CaptureCert {
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
