//! Protocol sniffing on freshly accepted sockets.
//!
//! The first bytes of a connection are inspected without consuming them to
//! decide whether the client is starting a TLS handshake or speaking the
//! plaintext command protocol. Classification looks at up to five bytes:
//! a TLS record starts with content type 22 (handshake), and the legacy
//! SSLv2-compatible ClientHello carries 0x01 at offset two. The version
//! pair refines the label when it matches a known major/minor.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

const SNIFF_LEN: usize = 5;
const SNIFF_POLL: Duration = Duration::from_millis(20);

/// TLS protocol version read from the handshake prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVariant {
    Ssl3,
    Tls1,
    Tls11,
    Unknown,
}

/// What the first bytes of a connection look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Plaintext command protocol, or nothing recognizable.
    Plain,
    /// TLS handshake prefix.
    Tls(TlsVariant),
}

fn variant_of(major: u8, minor: u8) -> TlsVariant {
    match (major, minor) {
        (3, 0) => TlsVariant::Ssl3,
        (3, 1) => TlsVariant::Tls1,
        (3, 2) => TlsVariant::Tls11,
        _ => TlsVariant::Unknown,
    }
}

/// Classifies a peeked prefix. Fewer than five bytes is always plain.
pub fn classify(prefix: &[u8]) -> Classification {
    if prefix.len() < SNIFF_LEN {
        return Classification::Plain;
    }
    if prefix[0] == 22 {
        return Classification::Tls(variant_of(prefix[1], prefix[2]));
    }
    if prefix[2] == 1 {
        return Classification::Tls(variant_of(prefix[3], prefix[4]));
    }
    Classification::Plain
}

/// Peeks at the socket until five bytes are available or the deadline
/// passes, then classifies. Peeking never consumes, so the handshake or
/// command line stays intact for the real reader.
pub async fn sniff_socket(
    socket: &TcpStream,
    deadline: Duration,
) -> std::io::Result<Classification> {
    let start = Instant::now();
    let mut prefix = [0u8; SNIFF_LEN];
    loop {
        let n = socket.peek(&mut prefix).await?;
        if n >= SNIFF_LEN {
            return Ok(classify(&prefix[..n]));
        }
        if n == 0 || start.elapsed() >= deadline {
            return Ok(Classification::Plain);
        }
        tokio::time::sleep(SNIFF_POLL).await;
    }
}
