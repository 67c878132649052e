//! Denied-host and brute-force accounting.
//!
//! Both tables are owned by the server context and passed by reference;
//! there is no process-global state. When attack blocking is disabled the
//! deny table accepts everything and records nothing.

use dashmap::DashMap;
use std::time::Duration;

/// Failed-authentication multiplier, applied as a pre-session delay.
const BRUTE_FORCE_DELAY_STEP: Duration = Duration::from_secs(2);

/// Attempts at which a host graduates from delayed to denied.
const BRUTE_FORCE_DENY_AT: u32 = 10;

/// Hosts refused before any protocol exchange.
pub struct DenyHost {
    entries: Option<DashMap<String, String>>,
}

impl DenyHost {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: enabled.then(DashMap::new),
        }
    }

    pub fn enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn is_denied(&self, host: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|m| m.contains_key(host))
    }

    pub fn deny(&self, host: &str, reason: &str) {
        if let Some(m) = &self.entries {
            tracing::warn!(host, reason, "host denied");
            m.insert(host.to_string(), reason.to_string());
        }
    }
}

/// Per-client-host failed authentication counters.
pub struct BruteForceTable {
    attempts: DashMap<String, u32>,
}

impl BruteForceTable {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
        }
    }

    /// Records a failed attempt, returning the updated count.
    pub fn record_failure(&self, host: &str) -> u32 {
        let mut entry = self.attempts.entry(host.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// A successful authentication clears the counter.
    pub fn clear(&self, host: &str) {
        self.attempts.remove(host);
    }

    pub fn attempts(&self, host: &str) -> u32 {
        self.attempts.get(host).map(|e| *e).unwrap_or(0)
    }

    /// Delay to apply before serving this host, growing with each failure.
    pub fn delay_for(&self, host: &str) -> Duration {
        BRUTE_FORCE_DELAY_STEP * self.attempts(host)
    }

    /// Whether this host has failed often enough to be denied outright.
    pub fn should_deny(&self, host: &str) -> bool {
        self.attempts(host) >= BRUTE_FORCE_DENY_AT
    }
}

impl Default for BruteForceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_table_disabled_accepts_everything() {
        let deny = DenyHost::new(false);
        deny.deny("10.0.0.1", "bad");
        assert!(!deny.is_denied("10.0.0.1"));
        assert!(!deny.enabled());
    }

    #[test]
    fn denied_host_stays_denied() {
        let deny = DenyHost::new(true);
        assert!(!deny.is_denied("10.0.0.1"));
        deny.deny("10.0.0.1", "unknown command flood");
        assert!(deny.is_denied("10.0.0.1"));
        assert!(!deny.is_denied("10.0.0.2"));
    }

    #[test]
    fn failures_grow_delay_until_denial() {
        let bf = BruteForceTable::new();
        assert_eq!(bf.delay_for("c"), Duration::ZERO);
        for _ in 0..9 {
            bf.record_failure("c");
        }
        assert_eq!(bf.attempts("c"), 9);
        assert_eq!(bf.delay_for("c"), Duration::from_secs(18));
        assert!(!bf.should_deny("c"));
        bf.record_failure("c");
        assert!(bf.should_deny("c"));
    }

    #[test]
    fn success_clears_counter() {
        let bf = BruteForceTable::new();
        bf.record_failure("c");
        bf.record_failure("c");
        bf.clear("c");
        assert_eq!(bf.attempts("c"), 0);
        assert_eq!(bf.delay_for("c"), Duration::ZERO);
    }
}
