//! TLS bootstrap and the unified session stream.
//!
//! The acceptor is built once at startup. Key material comes from, in
//! order: a one-time PEM import bundle, configured cert/key paths, or a
//! generated self-signed identity. Import bundles are cleared from the
//! in-memory configuration after loading so the material is not read
//! twice.

use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("failed to generate self-signed identity: {0}")]
    SelfSigned(String),
    #[error("invalid key material: {0}")]
    Config(#[from] rustls::Error),
}

/// Holds the acceptor for handshakes on sniffed-TLS connections.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl TlsContext {
    pub async fn accept(&self, socket: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.acceptor.accept(socket).await
    }
}

fn read_pem_identity(
    path: &str,
) -> Result<(Vec<CertificateDer<'static>>, Option<PrivateKeyDer<'static>>), TlsError> {
    let file = std::fs::File::open(path).map_err(|source| TlsError::Read {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut certs = Vec::new();
    let mut key = None;
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })? {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
            rustls_pemfile::Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
            rustls_pemfile::Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
            _ => {}
        }
    }
    Ok((certs, key))
}

fn self_signed_identity(
    name: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let names = vec!["localhost".to_string(), name.to_string()];
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TlsError::SelfSigned(e.to_string()))?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
    Ok((vec![cert], key))
}

/// Builds the TLS context per configuration. Returns `None` when TLS is
/// disabled. Takes the config mutably to clear a consumed import bundle.
pub fn init_tls(config: &mut TlsConfig, server_name: &str) -> Result<Option<TlsContext>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }

    let (certs, key) = if let Some(import) = config.import_path.take() {
        tracing::info!(path = %import, "importing TLS identity bundle");
        let (certs, key) = read_pem_identity(&import)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(import));
        }
        let key = key.ok_or(TlsError::NoKey(import))?;
        (certs, key)
    } else if let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) {
        let (certs, _) = read_pem_identity(cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(cert_path.clone()));
        }
        let (_, key) = read_pem_identity(key_path)?;
        let key = key.ok_or_else(|| TlsError::NoKey(key_path.clone()))?;
        (certs, key)
    } else {
        tracing::warn!("no TLS key material configured, generating self-signed identity");
        self_signed_identity(server_name)?
    };

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsContext {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
    }))
}

/// A session socket after protocol selection: raw TCP or TLS-wrapped.
pub enum ServerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Applies the session socket options: keep-alive off, linger bounded
/// by the session read timeout, no Nagle buffering.
pub fn configure_session_socket(
    socket: &TcpStream,
    linger: std::time::Duration,
) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(socket);
    sock.set_keepalive(false)?;
    sock.set_linger(Some(linger))?;
    socket.set_nodelay(true)?;
    Ok(())
}
