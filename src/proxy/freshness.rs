//! Cache storability and freshness decisions.
//!
//! Storability is judged on the origin response alone. Freshness is judged
//! against the request and the cached entry's age: explicit no-cache on
//! either side wins, then max-age, then Expires, then a ten percent
//! Last-Modified heuristic. An entry with no usable validators is treated
//! as stale.

use http::header;
use http::HeaderMap;

use crate::proxy::cache::CachedHeader;

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn cache_control_has(headers: &HeaderMap, directive: &str) -> bool {
    header_str(headers, header::CACHE_CONTROL)
        .map(|v| {
            v.split(',')
                .any(|d| d.trim().eq_ignore_ascii_case(directive))
        })
        .unwrap_or(false)
}

fn max_age_secs(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CACHE_CONTROL)?
        .split(',')
        .find_map(|d| {
            let d = d.trim();
            d.strip_prefix("max-age=")
                .or_else(|| d.strip_prefix("MAX-AGE="))
                .and_then(|v| v.parse().ok())
        })
}

fn date_ms(headers: &HeaderMap, name: header::HeaderName) -> Option<u64> {
    let raw = header_str(headers, name)?;
    let time = httpdate::parse_http_date(raw).ok()?;
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

/// Whether an origin response may be stored at all.
pub fn is_storeable(status: u16, headers: &HeaderMap) -> bool {
    if status != 200 {
        return false;
    }
    if cache_control_has(headers, "no-store")
        || cache_control_has(headers, "no-cache")
        || cache_control_has(headers, "private")
    {
        return false;
    }
    if header_str(headers, header::PRAGMA)
        .map(|v| v.eq_ignore_ascii_case("no-cache"))
        .unwrap_or(false)
    {
        return false;
    }
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    true
}

/// Whether a cached entry may answer this request without revalidation.
pub fn fresh_enough(request: &HeaderMap, cached: &CachedHeader, now_ms: u64) -> bool {
    // Client insists on an end-to-end fetch.
    if cache_control_has(request, "no-cache")
        || header_str(request, header::PRAGMA)
            .map(|v| v.eq_ignore_ascii_case("no-cache"))
            .unwrap_or(false)
    {
        return false;
    }
    if cache_control_has(&cached.headers, "no-cache")
        || cache_control_has(&cached.headers, "no-store")
    {
        return false;
    }

    let age_ms = now_ms.saturating_sub(cached.stored_ms);

    if let Some(max_age) = max_age_secs(&cached.headers) {
        return age_ms <= max_age * 1000;
    }
    if let Some(expires) = date_ms(&cached.headers, header::EXPIRES) {
        return now_ms < expires;
    }
    if let Some(modified) = date_ms(&cached.headers, header::LAST_MODIFIED) {
        let lifetime = cached.stored_ms.saturating_sub(modified) / 10;
        return age_ms < lifetime;
    }
    false
}
