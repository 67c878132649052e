//! Per-client access history with bounded, self-cleaning storage.
//!
//! Each tracked host keeps an ordered list of (timestamp, path) entries.
//! A global sweep runs at most once per cleanup cycle, piggybacked on the
//! mutating call rather than a dedicated timer task. Per-host caps and
//! expiry are additionally enforced on every insert for the touched host;
//! the global host cap evicts the host with the fewest entries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::config::TrackerConfig;
use crate::net::props::now_millis;

/// One recorded access.
#[derive(Debug, Clone)]
pub struct Track {
    pub time_ms: u64,
    pub path: String,
}

pub struct AccessTracker {
    hosts: DashMap<String, VecDeque<Track>>,
    max_tracking_ms: u64,
    max_tracking_count: usize,
    max_host_count: usize,
    cleanup_cycle_ms: u64,
    last_cleanup_ms: AtomicU64,
}

impl AccessTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            max_tracking_ms: config.max_tracking_time_secs * 1000,
            max_tracking_count: config.max_tracking_count,
            max_host_count: config.max_host_count,
            cleanup_cycle_ms: config.cleanup_cycle_secs * 1000,
            last_cleanup_ms: AtomicU64::new(0),
        }
    }

    /// Records an access for `host`. The touched host's expired entries
    /// are pruned and its cap enforced right here, so a single noisy
    /// client cannot grow unbounded between sweeps.
    pub fn track(&self, host: &str, path: &str) {
        self.maybe_sweep();
        if !self.hosts.contains_key(host) && self.hosts.len() >= self.max_host_count {
            self.evict_smallest();
        }
        let now = now_millis();
        let cutoff = now.saturating_sub(self.max_tracking_ms);
        let mut tracks = self.hosts.entry(host.to_string()).or_default();
        while tracks.front().is_some_and(|t| t.time_ms < cutoff) {
            tracks.pop_front();
        }
        tracks.push_back(Track {
            time_ms: now,
            path: path.to_string(),
        });
        while tracks.len() > self.max_tracking_count {
            tracks.pop_front();
        }
    }

    /// Number of accesses by `host` within the last `window_ms`.
    pub fn latest_access_count(&self, host: &str, window_ms: u64) -> usize {
        let Some(tracks) = self.hosts.get(host) else {
            return 0;
        };
        let cutoff = now_millis().saturating_sub(window_ms);
        tracks.iter().rev().take_while(|t| t.time_ms >= cutoff).count()
    }

    /// Most recent paths requested by `host`, newest last.
    pub fn latest_paths(&self, host: &str, limit: usize) -> Vec<String> {
        self.hosts
            .get(host)
            .map(|tracks| {
                tracks
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|t| t.path.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    /// Hosts currently tracked.
    pub fn access_hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|e| e.key().clone()).collect()
    }

    fn maybe_sweep(&self) {
        let now = now_millis();
        let last = self.last_cleanup_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.cleanup_cycle_ms {
            return;
        }
        if self
            .last_cleanup_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Another task is sweeping.
            return;
        }
        let cutoff = now.saturating_sub(self.max_tracking_ms);
        self.hosts.retain(|_, tracks| {
            while let Some(front) = tracks.front() {
                if front.time_ms < cutoff {
                    tracks.pop_front();
                } else {
                    break;
                }
            }
            while tracks.len() > self.max_tracking_count {
                tracks.pop_front();
            }
            !tracks.is_empty()
        });
        // Concurrent inserts can overshoot the host cap between the
        // contains_key check and the entry call; settle it here.
        while self.hosts.len() > self.max_host_count {
            self.evict_smallest();
        }
    }

    fn evict_smallest(&self) {
        let victim = self
            .hosts
            .iter()
            .min_by_key(|e| e.value().len())
            .map(|e| e.key().clone());
        if let Some(host) = victim {
            self.hosts.remove(&host);
        }
    }

    #[cfg(test)]
    fn force_sweep(&self) {
        self.last_cleanup_ms.store(0, Ordering::Relaxed);
        self.maybe_sweep();
    }

    #[cfg(test)]
    fn backdate(&self, host: &str, by_ms: u64) {
        if let Some(mut tracks) = self.hosts.get_mut(host) {
            for t in tracks.iter_mut() {
                t.time_ms = t.time_ms.saturating_sub(by_ms);
            }
        }
    }
}
