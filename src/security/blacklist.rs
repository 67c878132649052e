//! URL blacklist and yellow list.
//!
//! The blacklist decides before any network I/O whether a destination may
//! be contacted at all. The yellow list names registrable domains exempt
//! from User-Agent rewriting.

use std::collections::HashSet;

/// Destination filter consulted for every proxied URL.
pub trait UrlBlacklist: Send + Sync {
    /// True when `host`/`path` must not be fetched or served from cache.
    fn is_listed(&self, host: &str, path: &str) -> bool;
}

/// Blacklist backed by exact host entries and host/path-prefix patterns.
pub struct PatternBlacklist {
    hosts: HashSet<String>,
    prefixes: Vec<(String, String)>,
}

impl PatternBlacklist {
    pub fn new(hosts: &[String], patterns: &[String]) -> Self {
        let prefixes = patterns
            .iter()
            .filter_map(|p| {
                p.split_once('/')
                    .map(|(h, path)| (h.to_ascii_lowercase(), format!("/{path}")))
            })
            .collect();
        Self {
            hosts: hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            prefixes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.prefixes.is_empty()
    }
}

impl UrlBlacklist for PatternBlacklist {
    fn is_listed(&self, host: &str, path: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let host = host.split(':').next().unwrap_or(&host);
        if self.hosts.contains(host) {
            return true;
        }
        self.prefixes
            .iter()
            .any(|(h, prefix)| h == host && path.starts_with(prefix.as_str()))
    }
}

/// A blacklist that lists nothing.
pub struct OpenBlacklist;

impl UrlBlacklist for OpenBlacklist {
    fn is_listed(&self, _host: &str, _path: &str) -> bool {
        false
    }
}

/// Extracts the registrable label of a host name: the label left of the
/// top-level domain. `www.example.com` yields `example`; a bare label or
/// IP-like host is returned unchanged.
pub fn registrable_domain(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let Some(without_tld) = host.rfind('.').map(|i| &host[..i]) else {
        return host;
    };
    match without_tld.rfind('.') {
        Some(i) => without_tld[i + 1..].to_string(),
        None => without_tld.to_string(),
    }
}

/// Registrable domains whose traffic keeps the client's User-Agent.
pub struct YellowList {
    domains: HashSet<String>,
}

impl YellowList {
    pub fn new(entries: &[String]) -> Self {
        Self {
            domains: entries.iter().map(|d| d.to_ascii_lowercase()).collect(),
        }
    }

    pub fn contains_host(&self, host: &str) -> bool {
        !self.domains.is_empty() && self.domains.contains(&registrable_domain(host))
    }
}
