//! Forwarding proxy: handlers, cache, origin client and tunnels.

pub mod cache;
pub mod client;
pub mod freshness;
pub mod handler;
pub mod headers;
pub mod outcome;
pub mod redirector;
pub mod tunnel;

pub use cache::{CachedHeader, MemoryCache, ProxyCache};
pub use client::{AltResolver, NoAltResolver, OriginClient};
pub use handler::{HttpdHandler, Reply};
pub use outcome::OutcomeCode;
pub use redirector::Redirector;
