//! Peergate: the network core of a peer-to-peer web search node.
//!
//! One listening port serves both TLS and plaintext clients; accepted
//! connections are sniffed, wrapped, and run as command sessions. The
//! command set is a caching HTTP forward proxy (GET, HEAD, POST) plus
//! CONNECT tunnelling, with per-client access tracking, deny lists and
//! brute-force slowdown in front of it.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod security;

pub use config::PeergateConfig;
pub use error::ProxyError;
pub use net::{ConnectionServer, ServerContext};
