//! Header block parsing and rewriting for the forwarding path.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::error::ProxyError;

/// Headers that must not travel past a single hop, plus cache diagnostics
/// this node adds itself.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "transfer-encoding",
    "x-cache",
    "x-cache-lookup",
];

/// Parses header lines already read from the socket into a map. Repeated
/// names are appended, not replaced.
pub fn parse_header_lines(lines: &[String]) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProxyError::BadRequest(format!(
                "malformed header line: {line}"
            )));
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("bad header name in: {line}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::BadRequest(format!("bad header value in: {line}")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Strips hop-by-hop headers in place.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrites a client User-Agent to carry this node's product token. An
/// agent string ending in a parenthesized comment gets the token inside
/// the comment, anything else is replaced outright.
pub fn rewrite_user_agent(agent: Option<&str>, token: &str) -> String {
    match agent {
        Some(a) if a.ends_with(')') => {
            let mut out = a[..a.len() - 1].to_string();
            out.push_str("; ");
            out.push_str(token);
            out.push(')');
            out
        }
        _ => token.to_string(),
    }
}

/// Value appended to the Via chain for this hop.
pub fn via_value(http_version: &str, name: &str) -> String {
    let version = http_version.strip_prefix("HTTP/").unwrap_or("1.1");
    format!("{version} {name}")
}

/// Prepares client request headers for forwarding to the origin.
pub struct ForwardPolicy<'a> {
    pub proxy_name: &'a str,
    pub send_via: bool,
    pub send_x_forwarded_for: bool,
    pub keep_user_agent: bool,
    pub client_ip: &'a str,
    pub http_version: &'a str,
}

pub fn prepare_request_headers(headers: &HeaderMap, policy: &ForwardPolicy<'_>) -> HeaderMap {
    let mut out = headers.clone();
    remove_hop_by_hop(&mut out);
    // The transport sets Host and Content-Length itself.
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);

    if !policy.keep_user_agent {
        let agent = out
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let rewritten = rewrite_user_agent(agent.as_deref(), policy.proxy_name);
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
            out.insert(header::USER_AGENT, value);
        }
    }

    if policy.send_via {
        let hop = via_value(policy.http_version, policy.proxy_name);
        let chained = match out.get(header::VIA).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {hop}"),
            None => hop,
        };
        if let Ok(value) = HeaderValue::from_str(&chained) {
            out.insert(header::VIA, value);
        }
    }

    if policy.send_x_forwarded_for {
        if let Ok(value) = HeaderValue::from_str(policy.client_ip) {
            out.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }

    out
}

/// Prepares origin response headers for the client: strips hop-by-hop and
/// stamps a fresh Date.
pub fn prepare_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    remove_hop_by_hop(&mut out);
    let now = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&now) {
        out.insert(header::DATE, value);
    }
    out
}

/// How the response body length is conveyed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Content-Length is known.
    Length(u64),
    /// Chunked transfer coding, HTTP/1.1 clients only.
    Chunked,
    /// Length unknown on a pre-1.1 client: stream until close.
    Close,
    /// Bodyless status, Content-Length forced to zero.
    Empty,
}

/// Picks the downstream transfer mode for a response.
pub fn plan_transfer(status: u16, headers: &HeaderMap, http_version: &str) -> Transfer {
    if status == 204 || status == 304 {
        return Transfer::Empty;
    }
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(len) = length {
        return Transfer::Length(len);
    }
    if http_version == "HTTP/1.1" {
        Transfer::Chunked
    } else {
        Transfer::Close
    }
}
