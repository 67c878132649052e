//! Cache outcome codes recorded for every proxied exchange.

use std::fmt;

/// How the response body was obtained relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    /// Fetched from origin, nothing usable in the cache.
    Miss,
    /// Served from cache without origin contact.
    Hit,
    /// Client revalidation answered from fresh cache with 304.
    RefreshHit,
    /// Stale cache entry replaced by a differing origin response.
    RefreshMiss,
    /// Origin refetch replaced the discarded entry with a body of the
    /// same byte length.
    RefFailHit,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Miss => "MISS",
            OutcomeCode::Hit => "HIT",
            OutcomeCode::RefreshHit => "REFRESH_HIT",
            OutcomeCode::RefreshMiss => "REFRESH_MISS",
            OutcomeCode::RefFailHit => "REF_FAIL_HIT",
        }
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
