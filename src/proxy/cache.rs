//! Response cache abstraction and the in-memory implementation.
//!
//! The proxy consults the cache by full URL. Header metadata and body are
//! fetched separately because the serving path may need the headers before
//! deciding whether the body is wanted at all.

use dashmap::DashMap;
use http::HeaderMap;

use crate::net::props::now_millis;

/// Cached response metadata.
#[derive(Debug, Clone)]
pub struct CachedHeader {
    pub status: u16,
    pub headers: HeaderMap,
    /// When the entry was stored, ms since epoch.
    pub stored_ms: u64,
}

/// Storage consulted and fed by the proxy handlers.
pub trait ProxyCache: Send + Sync {
    /// Header metadata for `url`, if cached.
    fn response_header(&self, url: &str) -> Option<CachedHeader>;

    /// Cached body for `url`, if present.
    fn content(&self, url: &str) -> Option<Vec<u8>>;

    /// Stores a complete response.
    fn store(&self, url: &str, header: CachedHeader, body: Vec<u8>);

    /// Removes an entry, returning the length of the deleted body.
    fn delete(&self, url: &str) -> Option<u64>;
}

/// Bounded in-memory cache. Exceeding the entry cap evicts the oldest
/// entry by store time.
pub struct MemoryCache {
    entries: DashMap<String, (CachedHeader, Vec<u8>)>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().0.stored_ms)
            .map(|e| e.key().clone());
        if let Some(url) = victim {
            self.entries.remove(&url);
        }
    }
}

impl ProxyCache for MemoryCache {
    fn response_header(&self, url: &str) -> Option<CachedHeader> {
        self.entries.get(url).map(|e| e.value().0.clone())
    }

    fn content(&self, url: &str) -> Option<Vec<u8>> {
        self.entries.get(url).map(|e| e.value().1.clone())
    }

    fn store(&self, url: &str, header: CachedHeader, body: Vec<u8>) {
        if !self.entries.contains_key(url) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(url.to_string(), (header, body));
    }

    fn delete(&self, url: &str) -> Option<u64> {
        self.entries.remove(url).map(|(_, (_, body))| body.len() as u64)
    }
}

impl CachedHeader {
    pub fn new(status: u16, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            stored_ms: now_millis(),
        }
    }
}
