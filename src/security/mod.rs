//! Access control: deny/brute-force tables, access tracking, blacklists.

pub mod access_tracker;
pub mod blacklist;
pub mod deny;

pub use access_tracker::{AccessTracker, Track};
pub use blacklist::{registrable_domain, OpenBlacklist, PatternBlacklist, UrlBlacklist, YellowList};
pub use deny::{BruteForceTable, DenyHost};
