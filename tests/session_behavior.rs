//! Session-level behavior: timeouts, unknown commands, denied hosts and
//! proxy authentication.

mod common;

use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn idle_connection_times_out() {
    let mut config = test_config();
    config.server.timeout_secs = 1;
    let proxy = start_proxy(config).await;

    let started = std::time::Instant::now();
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        stream.read_to_end(&mut buf),
    )
    .await
    .expect("server should close the idle connection")
    .unwrap();
    assert_eq!(n, 0);
    assert!(started.elapsed() >= std::time::Duration::from_millis(900));
}

#[tokio::test]
async fn unknown_command_is_answered_and_closed() {
    let proxy = start_proxy(test_config()).await;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"FROBNICATE /x HTTP/1.1\r\n").await.unwrap();

    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 501);
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_lines_are_tolerated_up_to_a_limit() {
    let origin = spawn_origin(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let proxy = start_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    // A few stray blank lines before the real request are fine.
    stream.write_all(b"\r\n\r\n\r\n").await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ok HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn denied_host_is_dropped_before_any_exchange() {
    let proxy = start_proxy(test_config()).await;
    proxy.ctx.deny.deny("localhost", "test denial");

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        stream.read_to_end(&mut buf),
    )
    .await
    .expect("denied connection should be dropped")
    .unwrap();
    assert_eq!(n, 0, "no bytes may be served to a denied host");
}

#[tokio::test]
async fn proxy_authentication_is_enforced() {
    let origin = spawn_origin(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 6\r\n\r\nsecret",
    )
    .await;
    let proxy = {
        let mut config = test_config();
        // base64("user:pass")
        config.proxy.admin_account_b64 = "dXNlcjpwYXNz".to_string();
        start_proxy(config).await
    };

    let bare = format!(
        "GET http://127.0.0.1:{}/s HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let refused = proxy_request(&proxy, &bare).await;
    assert_eq!(refused.status, 407);
    assert!(refused
        .header("proxy-authenticate")
        .unwrap()
        .starts_with("Basic"));
    assert_eq!(origin.hit_count(), 0);
    assert_eq!(proxy.ctx.brute_force.attempts("localhost"), 1);

    let authed = format!(
        "GET http://127.0.0.1:{}/s HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let allowed = proxy_request(&proxy, &authed).await;
    assert_eq!(allowed.status, 200);
    assert_eq!(allowed.body, b"secret");
    // Success clears the failure counter.
    assert_eq!(proxy.ctx.brute_force.attempts("localhost"), 0);
}

#[tokio::test]
async fn tls_prefix_without_tls_config_is_dropped() {
    let proxy = start_proxy(test_config()).await;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    // A TLS ClientHello record prefix on a server with no TLS context.
    stream
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x00])
        .await
        .unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        stream.read_to_end(&mut buf),
    )
    .await
    .expect("connection should be closed")
    .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn requests_are_recorded_in_the_access_tracker() {
    let origin = spawn_origin(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 1\r\n\r\nx",
    )
    .await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "GET http://127.0.0.1:{}/tracked HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    proxy_request(&proxy, &request).await;

    assert_eq!(proxy.ctx.tracker.latest_access_count("localhost", 60_000), 1);
    assert_eq!(
        proxy.ctx.tracker.latest_paths("localhost", 1),
        vec!["/tracked".to_string()]
    );
}
