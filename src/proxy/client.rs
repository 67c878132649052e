//! Origin-side HTTP client.
//!
//! All origin fetches go through one shared client built at startup:
//! redirects are never followed (the client must see them), and an
//! upstream proxy-of-proxies is honored when configured. Host names may be
//! remapped by an alternative resolver before the fetch, which is how
//! peer-addressed URLs reach the right transport address.

use http::HeaderMap;

use crate::config::ProxyConfig;
use crate::error::{classify_fetch, ProxyError};

/// Maps non-DNS host names (peer addresses) to reachable hosts. The
/// default implementation resolves nothing.
pub trait AltResolver: Send + Sync {
    /// A substitute host for `host`, if this resolver knows one.
    fn resolve(&self, host: &str) -> Option<String>;
}

pub struct NoAltResolver;

impl AltResolver for NoAltResolver {
    fn resolve(&self, _host: &str) -> Option<String> {
        None
    }
}

/// Response from an origin fetch. Headers are snapshotted so the caller
/// can rewrite them while the body is still streaming in.
pub struct OriginResponse {
    pub status: u16,
    pub http_version: String,
    pub headers: HeaderMap,
    response: reqwest::Response,
}

impl OriginResponse {
    pub fn into_body_stream(
        self,
    ) -> impl futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> {
        self.response.bytes_stream()
    }
}

/// Shared upstream client.
pub struct OriginClient {
    client: reqwest::Client,
}

fn version_token(version: http::Version) -> String {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9".to_string(),
        http::Version::HTTP_10 => "HTTP/1.0".to_string(),
        http::Version::HTTP_11 => "HTTP/1.1".to_string(),
        http::Version::HTTP_2 => "HTTP/2.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    }
}

impl OriginClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let timeout = std::time::Duration::from_secs(config.fetch_timeout_secs);
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout);
        if config.remote_proxy.enabled {
            let upstream = format!(
                "http://{}:{}",
                config.remote_proxy.host, config.remote_proxy.port
            );
            let proxy = reqwest::Proxy::all(&upstream)
                .map_err(|e| ProxyError::Internal(format!("bad upstream proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build client: {e}")))?;
        Ok(Self { client })
    }

    /// Sends one request to the origin. Any response status is a success
    /// here; only transport failures are errors.
    pub async fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<OriginResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("bad method: {method}")))?;
        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(|e| classify_fetch(&e))?;
        Ok(OriginResponse {
            status: response.status().as_u16(),
            http_version: version_token(response.version()),
            headers: response.headers().clone(),
            response,
        })
    }
}

/// Candidate replacement hosts for a name that failed to resolve: the
/// www-prefix toggled, a missing dot after www repaired, and common
/// top-level domains substituted.
pub fn alternate_host_candidates(host: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(stripped) = host.strip_prefix("www.") {
        candidates.push(stripped.to_string());
    } else if let Some(glued) = host.strip_prefix("www") {
        if !glued.is_empty() && !glued.starts_with('.') {
            candidates.push(format!("www.{glued}"));
        }
        candidates.push(format!("www.{host}"));
    } else {
        candidates.push(format!("www.{host}"));
    }
    if let Some(dot) = host.rfind('.') {
        let stem = &host[..dot];
        for tld in ["com", "net", "org", "info", "de"] {
            let candidate = format!("{stem}.{tld}");
            if candidate != host {
                candidates.push(candidate);
            }
        }
    }
    candidates.dedup();
    candidates
}

/// Filters candidates down to those that actually resolve, within a short
/// overall budget. Used to decorate unknown-host error pages.
pub async fn resolvable_alternates(host: &str, limit: usize) -> Vec<String> {
    let mut found = Vec::new();
    for candidate in alternate_host_candidates(host) {
        if found.len() >= limit {
            break;
        }
        let lookup = tokio::net::lookup_host((candidate.clone(), 80));
        if let Ok(Ok(mut addrs)) =
            tokio::time::timeout(std::time::Duration::from_millis(500), lookup).await
        {
            if addrs.next().is_some() {
                found.push(candidate);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_toggle_www() {
        let c = alternate_host_candidates("www.example.foo");
        assert!(c.contains(&"example.foo".to_string()));
        assert!(c.contains(&"www.example.com".to_string()));

        let c = alternate_host_candidates("example.foo");
        assert!(c.contains(&"www.example.foo".to_string()));
        assert!(c.contains(&"example.com".to_string()));
    }

    #[test]
    fn candidates_repair_glued_www() {
        let c = alternate_host_candidates("wwwexample.foo");
        assert!(c.contains(&"www.example.foo".to_string()));
    }

    #[test]
    fn candidates_skip_identity() {
        let c = alternate_host_candidates("example.com");
        assert!(!c.contains(&"example.com".to_string()));
    }

    #[tokio::test]
    async fn alternates_are_drawn_from_candidates() {
        let host = "no-such-host-4711.invalid";
        let candidates = alternate_host_candidates(host);
        let found = resolvable_alternates(host, 3).await;
        assert!(found.len() <= 3);
        for name in &found {
            assert!(candidates.contains(name));
        }
    }
}
