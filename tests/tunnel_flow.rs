//! CONNECT tunnel behavior.

mod common;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn connect_establishes_transparent_tunnel() {
    let echo = spawn_echo().await;
    let proxy = start_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        echo.port(),
        echo.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let established = read_header_block(&mut stream).await;
    assert_eq!(established.status, 200);
    assert!(established.header("proxy-agent").is_some());

    // Bytes flow both ways untouched.
    stream.write_all(b"opaque \x00\x16 bytes").await.unwrap();
    let mut buf = [0u8; 15];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"opaque \x00\x16 bytes");
}

#[tokio::test]
async fn tunnel_tears_down_when_origin_closes() {
    let echo = spawn_echo().await;
    let proxy = start_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.0\r\n\r\n", echo.port());
    stream.write_all(request.as_bytes()).await.unwrap();
    let established = read_header_block(&mut stream).await;
    assert_eq!(established.status, 200);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();

    // Closing our side must wind the whole tunnel down; the proxy closes
    // towards us once the relay ends.
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        stream.read_to_end(&mut rest),
    )
    .await
    .expect("tunnel should close promptly")
    .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn connect_to_blacklisted_host_is_refused() {
    let echo = spawn_echo().await;
    let proxy = {
        let mut config = test_config();
        config.blacklist.hosts.push("127.0.0.1".to_string());
        start_proxy(config).await
    };

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port());
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 403);

    // No tunnel: the proxy closes the connection.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn connect_to_closed_port_reports_refusal() {
    let proxy = start_proxy(test_config()).await;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 403);
}
