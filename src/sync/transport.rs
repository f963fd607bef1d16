//! Sync Transport
//!
//! A sync session runs over one bidirectional byte stream. In production the
//! stream is a QUIC bi-stream (quinn, self-signed certificates between
//! control-plane replicas); tests plug in in-memory duplex pipes through
//! [`SyncConnector`].

use super::types::SyncError;
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a session stream.
pub struct SyncStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Remote address, for logs
    pub peer: String,
}

impl SyncStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }
}

/// Opens session streams to a global replica.
#[async_trait]
pub trait SyncConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<SyncStream, SyncError>;
}

/// Server name presented in certificates and SNI.
const SERVER_NAME: &str = "mesh-sync";

/// QUIC endpoint that can both accept and open sync streams.
pub struct QuicTransport {
    endpoint: Endpoint,
}

impl QuicTransport {
    /// Bind a server endpoint (which can also dial out).
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn server(addr: SocketAddr) -> anyhow::Result<Self> {
        install_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![
            SERVER_NAME.to_string(),
            "localhost".to_string(),
        ])?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let private_key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {:?}", e))?;

        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)?;
        let server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));

        let mut endpoint = Endpoint::server(server_config, addr)?;
        endpoint.set_default_client_config(client_config()?);
        tracing::info!("sync transport listening on {}", endpoint.local_addr()?);

        Ok(Self { endpoint })
    }

    /// Bind a client-only endpoint on an ephemeral port.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn client() -> anyhow::Result<Self> {
        install_crypto_provider();
        let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config()?);
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Wait for the next incoming connection. `None` once the endpoint is closed.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Complete an incoming connection and accept its session stream.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn open_incoming(incoming: quinn::Incoming) -> Result<SyncStream, SyncError> {
        let conn = incoming
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let peer = conn.remote_address().to_string();
        let (send, recv) = conn
            .accept_bi()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(SyncStream::new(Box::new(recv), Box::new(send), peer))
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

#[async_trait]
impl SyncConnector for QuicTransport {
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn connect(&self, address: &str) -> Result<SyncStream, SyncError> {
        let addr = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| SyncError::Transport(format!("cannot resolve {}", address)))?;

        let conn = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| SyncError::Transport(e.to_string()))?
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(SyncStream::new(Box::new(recv), Box::new(send), addr.to_string()))
    }
}

fn install_crypto_provider() {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn client_config() -> anyhow::Result<ClientConfig> {
    // Replicas use self-signed certificates
    let client_crypto = quinn::rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    )))
}

/// Skip server certificate verification for self-signed replica certs.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        vec![
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            quinn::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            quinn::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            quinn::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA256,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA384,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA512,
            quinn::rustls::SignatureScheme::ED25519,
        ]
    }
}
