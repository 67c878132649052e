//! Shared helpers for integration tests: a canned-response mock origin
//! and a raw proxy client.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use peergate::config::PeergateConfig;
use peergate::lifecycle::Shutdown;
use peergate::net::{ConnectionServer, ServerContext};

pub use peergate::proxy::cache::ProxyCache;

/// A mock origin server answering every request with the same canned
/// response, counting requests.
pub struct MockOrigin {
    pub addr: std::net::SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawns a mock origin. `response` is written verbatim for every
/// request; the connection closes afterwards.
pub async fn spawn_origin(response: &str) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let response = response.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let hits = hits_clone.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut request = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    MockOrigin { addr, hits }
}

/// Spawns a raw TCP echo server for tunnel tests.
pub async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A running proxy under test.
pub struct TestProxy {
    pub addr: std::net::SocketAddr,
    pub ctx: Arc<ServerContext>,
    pub shutdown: Shutdown,
}

/// Starts the proxy with the given configuration on an ephemeral port.
pub async fn start_proxy(mut config: PeergateConfig) -> TestProxy {
    config.server.address = "127.0.0.1:0".to_string();
    start_proxy_with(ServerContext::new(config).unwrap()).await
}

/// Starts the proxy around a prebuilt context (for swapping in custom
/// caches or blacklists).
pub async fn start_proxy_with(ctx: ServerContext) -> TestProxy {
    let ctx = Arc::new(ctx);
    let shutdown = Shutdown::new();
    let server = ConnectionServer::bind(ctx.clone(), None, shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    TestProxy {
        addr,
        ctx,
        shutdown,
    }
}

/// Default test configuration with short timeouts.
pub fn test_config() -> PeergateConfig {
    let mut config = PeergateConfig::default();
    config.server.address = "127.0.0.1:0".to_string();
    config.server.timeout_secs = 2;
    config.proxy.fetch_timeout_secs = 5;
    config.observability.access_log = false;
    config
}

/// One parsed HTTP response.
pub struct RawResponse {
    pub status: u16,
    pub headers: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        self.headers.lines().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            (n.trim().to_ascii_lowercase() == lower).then(|| v.trim().to_string())
        })
    }
}

/// Reads one response off the stream. Bodies are expected to be
/// Content-Length framed or closed-delimited.
pub async fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before headers finished");
        raw.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let (status_line, headers) = head.split_once("\r\n").unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut body = raw[header_end..].to_vec();
    let length: Option<usize> = headers.lines().find_map(|l| {
        let (n, v) = l.split_once(':')?;
        n.trim().eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
    });
    match length {
        Some(len) => {
            while body.len() < len {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed mid-body");
                body.extend_from_slice(&buf[..n]);
            }
            body.truncate(len);
        }
        None => loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
            }
        },
    }
    RawResponse {
        status,
        headers: headers.to_string(),
        body,
    }
}

/// Reads only the status line and header block. Used for CONNECT answers,
/// which carry no body framing.
pub async fn read_header_block(stream: &mut TcpStream) -> RawResponse {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before headers finished");
        raw.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&raw).into_owned();
    let (status_line, headers) = head.split_once("\r\n").unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
    RawResponse {
        status,
        headers: headers.to_string(),
        body: Vec::new(),
    }
}

/// Sends a request through the proxy on a fresh connection and reads the
/// response.
pub async fn proxy_request(proxy: &TestProxy, request: &str) -> RawResponse {
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(&mut stream).await
}
