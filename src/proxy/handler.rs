//! Forwarding proxy command handlers: GET, HEAD, POST and CONNECT.
//!
//! Handlers read the rest of the request from the session reader, enforce
//! policy (authentication, then blacklist) before any network contact,
//! consult the cache, fetch from the origin when needed, and write the
//! response directly to the session writer. Errors turn into plain-text
//! error pages unless response headers already went out, in which case the
//! connection is torn down instead.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use url::Url;

use crate::error::{classify_io, ProxyError, UnreachableKind};
use crate::net::line::LineReader;
use crate::net::props::{now_millis, ConnectionProperties};
use crate::net::server::ServerContext;
use crate::observability::logging::log_proxy_access;
use crate::observability::metrics;
use crate::proxy::cache::CachedHeader;
use crate::proxy::client::resolvable_alternates;
use crate::proxy::freshness;
use crate::proxy::headers::{
    parse_header_lines, plan_transfer, prepare_request_headers, prepare_response_headers,
    ForwardPolicy, Transfer,
};
use crate::proxy::outcome::OutcomeCode;
use crate::proxy::tunnel::run_tunnel;

const MAX_HEADER_LINES: usize = 128;

/// What the session loop does after a handler finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Keep the connection open for the next command.
    Resume,
    /// Close the connection.
    Terminate,
}

/// Per-session proxy handler.
pub struct HttpdHandler {
    ctx: Arc<ServerContext>,
    client_ip: String,
    read_timeout: Duration,
}

impl HttpdHandler {
    pub fn new(ctx: Arc<ServerContext>, client_ip: String) -> Self {
        let read_timeout = Duration::from_secs(ctx.config.server.timeout_secs);
        Self {
            ctx,
            client_ip,
            read_timeout,
        }
    }

    // ---- request-side plumbing -------------------------------------------

    async fn read_header_block<R>(
        &self,
        reader: &mut LineReader<R>,
    ) -> Result<HeaderMap, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let max_line = self.ctx.config.server.command_max_length;
        let mut lines = Vec::new();
        loop {
            let line = timeout(self.read_timeout, reader.read_line(max_line))
                .await
                .map_err(|_| ProxyError::ClientAbort)?
                .map_err(|e| classify_io(&e))?;
            match line {
                None => return Err(ProxyError::ClientAbort),
                Some(l) if l.is_empty() => break,
                Some(l) => {
                    if lines.len() >= MAX_HEADER_LINES {
                        return Err(ProxyError::BadRequest("too many header lines".into()));
                    }
                    lines.push(l);
                }
            }
        }
        parse_header_lines(&lines)
    }

    fn split_request_args<'a>(&self, args: &'a str) -> Result<(&'a str, String), ProxyError> {
        let mut parts = args.split_whitespace();
        let target = parts
            .next()
            .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?;
        let version = parts.next().unwrap_or("HTTP/0.9").to_string();
        Ok((target, version))
    }

    fn wants_persistent(version: &str, headers: &HeaderMap) -> bool {
        let token = headers
            .get(header::CONNECTION)
            .or_else(|| headers.get("proxy-connection"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        match version {
            "HTTP/1.1" => token.as_deref() != Some("close"),
            _ => token.as_deref() == Some("keep-alive"),
        }
    }

    /// Resolves the request target to a full URL. Absolute targets win;
    /// origin-form targets need a Host header.
    fn resolve_url(&self, target: &str, headers: &HeaderMap) -> Result<Url, ProxyError> {
        let raw = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    ProxyError::BadRequest("relative target without Host header".into())
                })?;
            format!("http://{host}{target}")
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| ProxyError::BadRequest(format!("unparseable target: {e}")))?;
        if let Some(host) = url.host_str() {
            if let Some(substitute) = self.ctx.resolver.resolve(host) {
                url.set_host(Some(&substitute))
                    .map_err(|_| ProxyError::BadRequest("bad substitute host".into()))?;
            }
        }
        Ok(url)
    }

    /// Authentication gate. Failed attempts feed the brute-force table and
    /// eventually deny the client host outright.
    fn check_auth(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        let expected = &self.ctx.config.proxy.admin_account_b64;
        if expected.is_empty() {
            return Ok(());
        }
        let provided = headers
            .get(header::PROXY_AUTHORIZATION)
            .or_else(|| headers.get(header::AUTHORIZATION))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .map(str::trim);
        if provided == Some(expected.as_str()) {
            self.ctx.brute_force.clear(&self.client_ip);
            return Ok(());
        }
        let attempts = self.ctx.brute_force.record_failure(&self.client_ip);
        tracing::warn!(
            client = %self.client_ip,
            attempts,
            "proxy authentication failed"
        );
        if self.ctx.brute_force.should_deny(&self.client_ip) {
            self.ctx
                .deny
                .deny(&self.client_ip, "repeated authentication failures");
        }
        Err(ProxyError::policy(407, "Proxy Authentication Required"))
    }

    fn check_blacklist(&self, host: &str, path: &str) -> Result<(), ProxyError> {
        if self.ctx.blacklist.is_listed(host, path) {
            tracing::info!(host, path, "request blocked by blacklist");
            return Err(ProxyError::policy(403, "URL blocked by content filter"));
        }
        Ok(())
    }

    // ---- response-side plumbing ------------------------------------------

    async fn write_head<W>(
        &self,
        writer: &mut W,
        props: &mut ConnectionProperties,
        status: u16,
        headers: &HeaderMap,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        let mut head = format!("{} {} {}\r\n", props.http_version, status, reason);
        for (name, value) in headers {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value.to_str().unwrap_or(""));
            head.push_str("\r\n");
        }
        head.push_str("Connection: ");
        head.push_str(if props.persistent { "keep-alive" } else { "close" });
        head.push_str("\r\n\r\n");

        writer
            .write_all(head.as_bytes())
            .await
            .map_err(|e| classify_io(&e))?;
        props.status = status;
        props.headers_sent = true;
        props.response_size += head.len() as u64;
        Ok(())
    }

    async fn write_body_piece<W>(
        &self,
        writer: &mut W,
        props: &mut ConnectionProperties,
        transfer: Transfer,
        data: &[u8],
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return Ok(());
        }
        if transfer == Transfer::Chunked {
            let frame = format!("{:x}\r\n", data.len());
            writer
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| classify_io(&e))?;
            writer.write_all(data).await.map_err(|e| classify_io(&e))?;
            writer
                .write_all(b"\r\n")
                .await
                .map_err(|e| classify_io(&e))?;
            props.response_size += (frame.len() + data.len() + 2) as u64;
        } else {
            writer.write_all(data).await.map_err(|e| classify_io(&e))?;
            props.response_size += data.len() as u64;
        }
        Ok(())
    }

    async fn finish_body<W>(
        &self,
        writer: &mut W,
        props: &mut ConnectionProperties,
        transfer: Transfer,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        if transfer == Transfer::Chunked {
            writer
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(|e| classify_io(&e))?;
            props.response_size += 5;
        }
        writer.flush().await.map_err(|e| classify_io(&e))?;
        Ok(())
    }

    async fn send_error_page<W>(
        &self,
        writer: &mut W,
        props: &mut ConnectionProperties,
        status: u16,
        message: &str,
        extra_headers: &[(&str, String)],
        detail: &[String],
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut body = format!("{status}: {message}\r\n");
        for line in detail {
            body.push_str(line);
            body.push_str("\r\n");
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        if let Ok(v) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert(header::CONTENT_LENGTH, v);
        }
        if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now()))
        {
            headers.insert(header::DATE, v);
        }
        for (name, value) in extra_headers {
            if let (Ok(n), Ok(v)) = (
                header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }
        props.persistent = false;
        if self.write_head(writer, props, status, &headers).await.is_ok() {
            let _ = writer.write_all(body.as_bytes()).await;
            props.response_size += body.len() as u64;
            let _ = writer.flush().await;
        }
    }

    /// Translates a handler result into the session-level reply, emitting
    /// the error page and access log entry as appropriate.
    async fn conclude<W>(
        &self,
        result: Result<(), ProxyError>,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Reply
    where
        W: AsyncWrite + Unpin,
    {
        match result {
            Ok(()) => {
                props.finish();
                self.log_access(props);
                if props.persistent {
                    Reply::Resume
                } else {
                    Reply::Terminate
                }
            }
            Err(ProxyError::ClientAbort) => {
                tracing::debug!(client = %self.client_ip, "client aborted exchange");
                Reply::Terminate
            }
            Err(e) => {
                let status = e.status();
                tracing::info!(
                    client = %self.client_ip,
                    url = %props.url,
                    status,
                    error = %e,
                    "request failed"
                );
                if !props.headers_sent {
                    let mut extra: Vec<(&str, String)> = Vec::new();
                    if status == 407 {
                        extra.push((
                            "proxy-authenticate",
                            format!("Basic realm=\"{}\"", self.ctx.config.proxy.name),
                        ));
                    }
                    self.send_error_page(writer, props, status, &e.to_string(), &extra, &[])
                        .await;
                } else {
                    props.persistent = false;
                }
                if props.status == 0 {
                    props.status = status;
                }
                props.finish();
                self.log_access(props);
                Reply::Terminate
            }
        }
    }

    fn log_access(&self, props: &ConnectionProperties) {
        if self.ctx.config.observability.access_log {
            log_proxy_access(props);
        }
        if let Some(outcome) = props.outcome {
            metrics::record_proxy_request(outcome.as_str(), props.status);
        }
    }

    // ---- GET / HEAD ------------------------------------------------------

    pub async fn handle_fetch<R, W>(
        &self,
        method: &str,
        args: &str,
        reader: &mut LineReader<R>,
        writer: &mut W,
    ) -> Reply
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut props = ConnectionProperties::new(self.client_ip.clone());
        props.method = method.to_string();
        let result = self
            .fetch_inner(method, args, reader, writer, &mut props)
            .await;
        self.conclude(result, writer, &mut props).await
    }

    async fn fetch_inner<R, W>(
        &self,
        method: &str,
        args: &str,
        reader: &mut LineReader<R>,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (target, version) = self.split_request_args(args)?;
        props.http_version = version;
        let request_headers = self.read_header_block(reader).await?;
        props.persistent = Self::wants_persistent(&props.http_version, &request_headers);

        self.check_auth(&request_headers)?;

        let mut url = self.resolve_url(target, &request_headers)?;
        if let Some(redirector) = &self.ctx.redirector {
            if let Some(replacement) = redirector.redirect(&url).await {
                url = replacement;
            }
        }
        let host = url.host_str().unwrap_or("").to_string();
        props.host = host.clone();
        props.port = url.port_or_known_default().unwrap_or(80);
        props.path = url.path().to_string();
        props.args = url.query().map(str::to_owned);
        props.url = url.to_string();

        self.ctx.tracker.track(&self.client_ip, url.path());
        self.check_blacklist(&host, url.path())?;

        if method == "HEAD" {
            return self.head_from_origin(&url, &request_headers, writer, props).await;
        }

        // GET: try the cache first.
        let cached = self.ctx.cache.response_header(url.as_str());
        if let Some(entry) = &cached {
            if let Some(body) = self.ctx.cache.content(url.as_str()) {
                if freshness::fresh_enough(&request_headers, entry, now_millis()) {
                    return self
                        .serve_from_cache(entry, body, &request_headers, writer, props)
                        .await;
                }
            }
        }
        self.fetch_from_origin(&url, &request_headers, cached, writer, props)
            .await
    }

    async fn head_from_origin<W>(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let origin_headers = self.forward_headers(url, request_headers, props);
        let response = self
            .ctx
            .origin
            .fetch("HEAD", url.as_str(), origin_headers, None)
            .await?;
        props.mime = mime_of(&response.headers);
        let out = prepare_response_headers(&response.headers);
        props.outcome = Some(OutcomeCode::Miss);
        self.write_head(writer, props, response.status, &out).await?;
        writer.flush().await.map_err(|e| classify_io(&e))?;
        Ok(())
    }

    async fn serve_from_cache<W>(
        &self,
        entry: &CachedHeader,
        body: Vec<u8>,
        request_headers: &HeaderMap,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        props.mime = mime_of(&entry.headers);
        let mut out = prepare_response_headers(&entry.headers);

        if request_headers.contains_key(header::IF_MODIFIED_SINCE) {
            // Fresh entry answers the revalidation itself.
            out.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            props.outcome = Some(OutcomeCode::RefreshHit);
            self.write_head(writer, props, 304, &out).await?;
            writer.flush().await.map_err(|e| classify_io(&e))?;
            return Ok(());
        }

        if let Ok(v) = HeaderValue::from_str(&body.len().to_string()) {
            out.insert(header::CONTENT_LENGTH, v);
        }
        props.outcome = Some(OutcomeCode::Hit);
        self.write_head(writer, props, 203, &out).await?;
        self.write_body_piece(writer, props, Transfer::Length(body.len() as u64), &body)
            .await?;
        writer.flush().await.map_err(|e| classify_io(&e))?;
        Ok(())
    }

    fn forward_headers(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        props: &ConnectionProperties,
    ) -> HeaderMap {
        let host = url.host_str().unwrap_or("");
        let policy = ForwardPolicy {
            proxy_name: &self.ctx.config.proxy.name,
            send_via: self.ctx.config.proxy.send_via_header,
            send_x_forwarded_for: self.ctx.config.proxy.send_x_forwarded_for,
            keep_user_agent: self.ctx.yellow.contains_host(host),
            client_ip: &self.client_ip,
            http_version: &props.http_version,
        };
        prepare_request_headers(request_headers, &policy)
    }

    fn body_is_storeable(&self, status: u16, headers: &HeaderMap) -> bool {
        if !freshness::is_storeable(status, headers) {
            return false;
        }
        if self.ctx.config.proxy.cache_enabled {
            return true;
        }
        let mime = mime_of(headers);
        self.ctx
            .config
            .proxy
            .indexable_types
            .iter()
            .any(|t| t == &mime)
    }

    async fn fetch_from_origin<W>(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        stale: Option<CachedHeader>,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        // A stale entry is discarded up front; its byte length is kept to
        // recognize a same-sized replacement.
        let stale_len = if stale.is_some() {
            self.ctx.cache.delete(url.as_str())
        } else {
            None
        };

        let origin_headers = self.forward_headers(url, request_headers, props);
        let response = self
            .ctx
            .origin
            .fetch("GET", url.as_str(), origin_headers, None)
            .await;
        let response = match response {
            Ok(r) => r,
            Err(ProxyError::Unreachable {
                kind: UnreachableKind::UnknownHost,
                message,
            }) => {
                let alternates = resolvable_alternates(&props.host, 3).await;
                let mut message = message;
                if !alternates.is_empty() {
                    message.push_str("; try: ");
                    message.push_str(&alternates.join(", "));
                }
                return Err(ProxyError::Unreachable {
                    kind: UnreachableKind::UnknownHost,
                    message,
                });
            }
            Err(e) => return Err(e),
        };

        props.mime = mime_of(&response.headers);
        let status = response.status;
        let mut out = prepare_response_headers(&response.headers);
        let transfer = plan_transfer(status, &out, &props.http_version);
        match transfer {
            Transfer::Chunked => {
                out.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            Transfer::Close => {
                props.persistent = false;
                out.remove(header::CONTENT_LENGTH);
            }
            Transfer::Empty => {
                out.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            Transfer::Length(_) => {}
        }

        let mut storing = self.body_is_storeable(status, &response.headers);
        let response_headers = response.headers.clone();
        self.write_head(writer, props, status, &out).await?;

        let mut captured: Vec<u8> = Vec::new();
        let max_capture = self.ctx.config.proxy.max_cache_body_bytes;
        let mut body_len: u64 = 0;
        let mut stream = response.into_body_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    // Mid-body origin failure: nothing sane can be sent any
                    // more, tear the connection down.
                    props.persistent = false;
                    return Err(crate::error::classify_fetch(&e));
                }
            };
            if transfer != Transfer::Empty {
                self.write_body_piece(writer, props, transfer, &chunk).await?;
            }
            body_len += chunk.len() as u64;
            if storing {
                if captured.len() + chunk.len() > max_capture {
                    storing = false;
                    captured.clear();
                } else {
                    captured.extend_from_slice(&chunk);
                }
            }
        }
        self.finish_body(writer, props, transfer).await?;

        props.outcome = Some(refresh_outcome(stale_len, body_len));
        if storing {
            self.ctx.cache.store(
                url.as_str(),
                CachedHeader::new(status, response_headers),
                captured,
            );
        }
        Ok(())
    }

    // ---- POST ------------------------------------------------------------

    pub async fn handle_post<R, W>(
        &self,
        args: &str,
        reader: &mut LineReader<R>,
        writer: &mut W,
    ) -> Reply
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut props = ConnectionProperties::new(self.client_ip.clone());
        props.method = "POST".to_string();
        let result = self.post_inner(args, reader, writer, &mut props).await;
        self.conclude(result, writer, &mut props).await
    }

    async fn post_inner<R, W>(
        &self,
        args: &str,
        reader: &mut LineReader<R>,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (target, version) = self.split_request_args(args)?;
        props.http_version = version;
        let request_headers = self.read_header_block(reader).await?;
        props.persistent = Self::wants_persistent(&props.http_version, &request_headers);

        self.check_auth(&request_headers)?;

        let url = self.resolve_url(target, &request_headers)?;
        let host = url.host_str().unwrap_or("").to_string();
        props.host = host.clone();
        props.port = url.port_or_known_default().unwrap_or(80);
        props.path = url.path().to_string();
        props.url = url.to_string();

        self.ctx.tracker.track(&self.client_ip, url.path());
        self.check_blacklist(&host, url.path())?;

        let length = request_headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| ProxyError::policy(411, "Length Required"))?;
        if length > self.ctx.config.proxy.max_post_body_bytes {
            return Err(ProxyError::policy(413, "Payload Too Large"));
        }
        let body = timeout(self.read_timeout, reader.read_exact(length))
            .await
            .map_err(|_| ProxyError::ClientAbort)?
            .map_err(|e| classify_io(&e))?;

        let mut origin_headers = self.forward_headers(&url, &request_headers, props);
        if let Some(ct) = request_headers.get(header::CONTENT_TYPE) {
            origin_headers.insert(header::CONTENT_TYPE, ct.clone());
        }
        let response = self
            .ctx
            .origin
            .fetch("POST", url.as_str(), origin_headers, Some(body))
            .await?;

        props.mime = mime_of(&response.headers);
        let status = response.status;
        let mut out = prepare_response_headers(&response.headers);
        let transfer = plan_transfer(status, &out, &props.http_version);
        match transfer {
            Transfer::Chunked => {
                out.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            Transfer::Close => {
                props.persistent = false;
                out.remove(header::CONTENT_LENGTH);
            }
            Transfer::Empty => {
                out.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            Transfer::Length(_) => {}
        }
        props.outcome = Some(OutcomeCode::Miss);
        self.write_head(writer, props, status, &out).await?;

        let mut stream = response.into_body_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                props.persistent = false;
                crate::error::classify_fetch(&e)
            })?;
            if transfer != Transfer::Empty {
                self.write_body_piece(writer, props, transfer, &chunk).await?;
            }
        }
        self.finish_body(writer, props, transfer).await?;
        Ok(())
    }

    // ---- CONNECT ---------------------------------------------------------

    /// Establishes a raw tunnel. Consumes the session's reader and writer;
    /// the session always ends when the tunnel does.
    pub async fn handle_connect<R, W>(
        &self,
        args: &str,
        mut reader: LineReader<R>,
        mut writer: W,
    ) -> Reply
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut props = ConnectionProperties::new(self.client_ip.clone());
        props.method = "CONNECT".to_string();
        let result = self
            .connect_inner(args, &mut reader, &mut writer, &mut props)
            .await;
        match result {
            Ok(Some((origin, early))) => {
                metrics::record_tunnel_established();
                if !early.is_empty() && writer.write_all(&early).await.is_err() {
                    return Reply::Terminate;
                }
                let leftover = reader.take_buffered();
                let (client_read, _) = reader.into_parts();
                let (origin_read, mut origin_write) = tokio::io::split(origin);
                if !leftover.is_empty() && origin_write.write_all(&leftover).await.is_err() {
                    return Reply::Terminate;
                }
                let relayed = run_tunnel(client_read, writer, origin_read, origin_write).await;
                props.response_size += relayed;
                props.finish();
                self.log_access(&props);
                Reply::Terminate
            }
            // Upstream refused the tunnel; its answer was already relayed.
            Ok(None) => {
                props.finish();
                self.log_access(&props);
                Reply::Terminate
            }
            Err(e) => {
                self.conclude(Err(e), &mut writer, &mut props).await;
                Reply::Terminate
            }
        }
    }

    async fn connect_inner<R, W>(
        &self,
        args: &str,
        reader: &mut LineReader<R>,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<Option<(tokio::net::TcpStream, Vec<u8>)>, ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (target, version) = self.split_request_args(args)?;
        props.http_version = version;
        let (host, port) = match target.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .map_err(|_| ProxyError::BadRequest(format!("bad port in {target}")))?,
            ),
            None => (target.to_string(), 80),
        };
        props.host = host.clone();
        props.port = port;
        props.url = format!("{host}:{port}");

        let request_headers = self.read_header_block(reader).await?;
        self.check_auth(&request_headers)?;
        self.ctx.tracker.track(&self.client_ip, &props.url);
        self.check_blacklist(&host, "/")?;

        let remote = &self.ctx.config.proxy.remote_proxy;
        let connect_timeout = Duration::from_secs(self.ctx.config.proxy.fetch_timeout_secs);
        let origin = if remote.enabled && remote.use_for_ssl {
            let upstream = timeout(
                connect_timeout,
                tokio::net::TcpStream::connect((remote.host.as_str(), remote.port)),
            )
            .await
            .map_err(|_| ProxyError::Unreachable {
                kind: UnreachableKind::Timeout,
                message: format!("upstream proxy {}:{}", remote.host, remote.port),
            })?
            .map_err(|e| map_connect_error(&e, &remote.host))?;
            match self
                .connect_via_upstream(upstream, &host, port, writer, props)
                .await?
            {
                Some(stream) => stream,
                None => return Ok(None),
            }
        } else {
            let stream = timeout(
                connect_timeout,
                tokio::net::TcpStream::connect((host.as_str(), port)),
            )
            .await
            .map_err(|_| ProxyError::Unreachable {
                kind: UnreachableKind::Timeout,
                message: format!("{host}:{port}"),
            })?
            .map_err(|e| map_connect_error(&e, &host))?;
            (stream, Vec::new())
        };

        let established = format!(
            "{} 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
            props.http_version, self.ctx.config.proxy.name
        );
        writer
            .write_all(established.as_bytes())
            .await
            .map_err(|e| classify_io(&e))?;
        writer.flush().await.map_err(|e| classify_io(&e))?;
        props.status = 200;
        props.headers_sent = true;
        props.response_size += established.len() as u64;
        Ok(Some(origin))
    }

    /// Issues CONNECT to the upstream proxy. A non-success answer is
    /// relayed to the client verbatim and ends the exchange.
    async fn connect_via_upstream<W>(
        &self,
        upstream: tokio::net::TcpStream,
        host: &str,
        port: u16,
        writer: &mut W,
        props: &mut ConnectionProperties,
    ) -> Result<Option<(tokio::net::TcpStream, Vec<u8>)>, ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut upstream = upstream;
        let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        upstream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProxyError::Internal(format!("upstream proxy write: {e}")))?;

        let mut up_reader = LineReader::new(upstream);
        let status_line = timeout(self.read_timeout, up_reader.read_line(8192))
            .await
            .map_err(|_| ProxyError::Unreachable {
                kind: UnreachableKind::Timeout,
                message: "upstream proxy answer".into(),
            })?
            .map_err(|e| ProxyError::Internal(format!("upstream proxy read: {e}")))?
            .ok_or_else(|| ProxyError::Internal("upstream proxy closed".into()))?;
        let mut header_lines = Vec::new();
        loop {
            let line = timeout(self.read_timeout, up_reader.read_line(8192))
                .await
                .map_err(|_| ProxyError::Unreachable {
                    kind: UnreachableKind::Timeout,
                    message: "upstream proxy answer".into(),
                })?
                .map_err(|e| ProxyError::Internal(format!("upstream proxy read: {e}")))?;
            match line {
                None => break,
                Some(l) if l.is_empty() => break,
                Some(l) => header_lines.push(l),
            }
        }
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(502);

        if (200..400).contains(&status) {
            let (stream, early) = up_reader.into_parts();
            return Ok(Some((stream, early)));
        }

        // Relay the refusal as-is.
        let mut relayed = format!("{status_line}\r\n");
        for line in &header_lines {
            relayed.push_str(line);
            relayed.push_str("\r\n");
        }
        relayed.push_str("\r\n");
        writer
            .write_all(relayed.as_bytes())
            .await
            .map_err(|e| classify_io(&e))?;
        writer.flush().await.map_err(|e| classify_io(&e))?;
        props.status = status;
        props.headers_sent = true;
        props.persistent = false;
        props.response_size += relayed.len() as u64;
        tracing::info!(status, host, "upstream proxy refused tunnel");
        Ok(None)
    }
}

fn mime_of(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_default()
}

/// Classifies a completed origin fetch against the entry it replaced.
/// A replacement of the same byte length counts as a failed refresh
/// (the origin served nothing new), a different length as a real miss.
fn refresh_outcome(replaced_len: Option<u64>, body_len: u64) -> OutcomeCode {
    match replaced_len {
        None => OutcomeCode::Miss,
        Some(n) if n == body_len => OutcomeCode::RefFailHit,
        Some(_) => OutcomeCode::RefreshMiss,
    }
}

fn map_connect_error(e: &std::io::Error, host: &str) -> ProxyError {
    use std::io::ErrorKind;
    let kind = match e.kind() {
        ErrorKind::ConnectionRefused => UnreachableKind::Refused,
        ErrorKind::TimedOut => UnreachableKind::Timeout,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => UnreachableKind::NoRoute,
        _ => {
            let digest = e.to_string().to_ascii_lowercase();
            if digest.contains("resolve") || digest.contains("name") {
                UnreachableKind::UnknownHost
            } else {
                UnreachableKind::NoRoute
            }
        }
    };
    ProxyError::Unreachable {
        kind,
        message: format!("{host}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_rules() {
        let mut h = HeaderMap::new();
        assert!(HttpdHandler::wants_persistent("HTTP/1.1", &h));
        assert!(!HttpdHandler::wants_persistent("HTTP/1.0", &h));
        h.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!HttpdHandler::wants_persistent("HTTP/1.1", &h));
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(HttpdHandler::wants_persistent("HTTP/1.0", &h));
    }

    #[test]
    fn mime_extraction_drops_parameters() {
        let mut h = HeaderMap::new();
        h.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert_eq!(mime_of(&h), "text/html");
        assert_eq!(mime_of(&HeaderMap::new()), "");
    }

    #[test]
    fn refetch_outcome_keyed_on_replaced_length() {
        assert_eq!(refresh_outcome(None, 42), OutcomeCode::Miss);
        assert_eq!(refresh_outcome(Some(42), 42), OutcomeCode::RefFailHit);
        assert_eq!(refresh_outcome(Some(42), 7), OutcomeCode::RefreshMiss);
        // An unstoreable replacement still counts as a refresh miss.
        assert_eq!(refresh_outcome(Some(0), 7), OutcomeCode::RefreshMiss);
    }

    #[test]
    fn connect_errors_map_to_taxonomy() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            map_connect_error(&refused, "h"),
            ProxyError::Unreachable {
                kind: UnreachableKind::Refused,
                ..
            }
        ));
        let dns = std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to resolve host name",
        );
        assert!(matches!(
            map_connect_error(&dns, "h"),
            ProxyError::Unreachable {
                kind: UnreachableKind::UnknownHost,
                ..
            }
        ));
    }
}
