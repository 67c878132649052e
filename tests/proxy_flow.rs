//! End-to-end proxy behavior: fetching, caching, revalidation, policy
//! denials and POST forwarding.

mod common;

use common::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn origin_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nCache-Control: max-age=60\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[tokio::test]
async fn fresh_fetch_serves_body_and_stores() {
    let origin = spawn_origin(&origin_response("<html>hello</html>")).await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "GET http://127.0.0.1:{}/page HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"<html>hello</html>");
    assert_eq!(origin.hit_count(), 1);

    // The entry landed in the cache.
    let url = format!("http://127.0.0.1:{}/page", origin.addr.port());
    assert!(proxy.ctx.cache.response_header(&url).is_some());
    assert_eq!(
        proxy.ctx.cache.content(&url).unwrap(),
        b"<html>hello</html>"
    );
}

#[tokio::test]
async fn second_fetch_is_answered_from_cache() {
    let origin = spawn_origin(&origin_response("cached content")).await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let first = proxy_request(&proxy, &request).await;
    assert_eq!(first.status, 200);

    let second = proxy_request(&proxy, &request).await;
    // Cache answers carry the non-authoritative status.
    assert_eq!(second.status, 203);
    assert_eq!(second.body, b"cached content");
    assert_eq!(origin.hit_count(), 1, "origin must not be contacted again");
}

#[tokio::test]
async fn conditional_request_on_fresh_entry_gets_304() {
    let origin = spawn_origin(&origin_response("revalidated")).await;
    let proxy = start_proxy(test_config()).await;

    let plain = format!(
        "GET http://127.0.0.1:{}/y HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    assert_eq!(proxy_request(&proxy, &plain).await.status, 200);

    let conditional = format!(
        "GET http://127.0.0.1:{}/y HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nIf-Modified-Since: Mon, 01 Jan 2024 00:00:00 GMT\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &conditional).await;
    assert_eq!(response.status, 304);
    assert_eq!(response.header("content-length").as_deref(), Some("0"));
    assert!(response.body.is_empty());
    assert_eq!(origin.hit_count(), 1);
}

#[tokio::test]
async fn blacklisted_host_gets_403_without_origin_contact() {
    let origin = spawn_origin(&origin_response("never served")).await;
    let proxy = {
        let mut config = test_config();
        config.blacklist.hosts.push("127.0.0.1".to_string());
        start_proxy(config).await
    };

    let request = format!(
        "GET http://127.0.0.1:{}/secret HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 403);
    assert_eq!(origin.hit_count(), 0);
    // Nothing cached either.
    let url = format!("http://127.0.0.1:{}/secret", origin.addr.port());
    assert!(proxy.ctx.cache.response_header(&url).is_none());
}

#[tokio::test]
async fn post_body_is_forwarded() {
    let origin = spawn_origin(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 8\r\n\r\naccepted",
    )
    .await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "POST http://127.0.0.1:{}/submit HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\npayload",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"accepted");
    assert_eq!(origin.hit_count(), 1);
}

#[tokio::test]
async fn post_without_length_is_rejected() {
    let origin = spawn_origin(&origin_response("unused")).await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "POST http://127.0.0.1:{}/submit HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 411);
    assert_eq!(origin.hit_count(), 0);
}

#[tokio::test]
async fn oversized_post_claim_is_rejected_before_buffering() {
    let origin = spawn_origin(&origin_response("unused")).await;
    let proxy = {
        let mut config = test_config();
        config.proxy.max_post_body_bytes = 1024;
        start_proxy(config).await
    };

    // The claimed length alone must trigger the rejection; no body is
    // sent and the origin is never contacted.
    let request = format!(
        "POST http://127.0.0.1:{}/big HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 1073741824\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 413);
    assert_eq!(origin.hit_count(), 0);
}

#[tokio::test]
async fn stale_entry_is_refetched_and_replaced() {
    use http::header::{self, HeaderValue};
    use peergate::proxy::cache::CachedHeader;

    let origin = spawn_origin(&origin_response("fresh from origin")).await;
    let proxy = start_proxy(test_config()).await;
    let url = format!("http://127.0.0.1:{}/stale", origin.addr.port());

    // Seed an entry whose max-age expired long ago.
    let mut headers = http::HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=60"),
    );
    let mut seeded = CachedHeader::new(200, headers);
    seeded.stored_ms = 1;
    proxy.ctx.cache.store(&url, seeded, b"previous".to_vec());

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        url,
        origin.addr.port()
    );
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"fresh from origin");
    assert_eq!(origin.hit_count(), 1, "stale entry must be revalidated");
    assert_eq!(
        proxy.ctx.cache.content(&url).unwrap(),
        b"fresh from origin",
        "replacement body must land in the cache"
    );
}

#[tokio::test]
async fn keep_alive_serves_two_requests_on_one_connection() {
    let origin = spawn_origin(&origin_response("again and again")).await;
    let proxy = start_proxy(test_config()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ka HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );

    stream.write_all(request.as_bytes()).await.unwrap();
    let first = read_response(&mut stream).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("connection").as_deref(), Some("keep-alive"));

    stream.write_all(request.as_bytes()).await.unwrap();
    let second = read_response(&mut stream).await;
    assert_eq!(second.status, 203);
    assert_eq!(second.body, b"again and again");
}

#[tokio::test]
async fn unreachable_origin_yields_error_page() {
    let proxy = start_proxy(test_config()).await;
    // Port 1 on loopback is almost certainly closed.
    let request =
        "GET http://127.0.0.1:1/nope HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n".to_string();
    let response = proxy_request(&proxy, &request).await;
    assert_eq!(response.status, 403);
    assert!(!response.body.is_empty());
}

#[tokio::test]
async fn head_request_returns_headers_only() {
    let origin = spawn_origin(&origin_response("body not for head")).await;
    let proxy = start_proxy(test_config()).await;

    let request = format!(
        "HEAD http://127.0.0.1:{}/h HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin.addr.port(),
        origin.addr.port()
    );
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    // HEAD answers carry no body; the connection closing proves it.
    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut raw)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.ends_with("\r\n\r\n"), "no body after the header block");
    assert_eq!(origin.hit_count(), 1);
}
