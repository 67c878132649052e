//! Network core: listener, protocol sniffing, TLS and sessions.

pub mod line;
pub mod props;
pub mod server;
pub mod session;
pub mod sniff;
pub mod tls;

pub use line::LineReader;
pub use props::ConnectionProperties;
pub use server::{resolve_bind_address, ConnectionServer, ServerContext};
pub use session::SessionRegistry;
pub use sniff::{classify, Classification, TlsVariant};
pub use tls::{init_tls, ServerStream, TlsContext};
