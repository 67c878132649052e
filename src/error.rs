//! Error taxonomy for the connection server and proxy handlers.
//!
//! Failures are classified by what the session loop should do with them:
//! client aborts end the session silently, policy denials produce an error
//! page with the denial status, unreachable origins produce an error page
//! with a digest of the cause, and everything else is an internal error.

use std::error::Error as _;

use thiserror::Error;

/// Why an origin could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableKind {
    /// Connection refused by the destination host.
    Refused,
    /// No route to the destination host.
    NoRoute,
    /// Destination host name could not be resolved.
    UnknownHost,
    /// Connection attempt timed out.
    Timeout,
}

impl UnreachableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnreachableKind::Refused => "connection refused",
            UnreachableKind::NoRoute => "no route to host",
            UnreachableKind::UnknownHost => "unknown host",
            UnreachableKind::Timeout => "connection timed out",
        }
    }
}

/// Errors surfaced by command handlers to the session loop.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client closed or broke the connection mid-exchange. The session
    /// ends without an error page.
    #[error("client aborted connection")]
    ClientAbort,

    /// Request denied by policy before any origin contact.
    #[error("request denied: {reason}")]
    Policy { status: u16, reason: String },

    /// The origin could not be reached.
    #[error("origin unreachable: {}: {message}", kind.as_str())]
    Unreachable {
        kind: UnreachableKind,
        message: String,
    },

    /// The request line or headers could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn policy(status: u16, reason: impl Into<String>) -> Self {
        ProxyError::Policy {
            status,
            reason: reason.into(),
        }
    }

    /// HTTP status an error page for this failure carries.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::ClientAbort => 0,
            ProxyError::Policy { status, .. } => *status,
            ProxyError::Unreachable { kind, .. } => match kind {
                UnreachableKind::Refused => 403,
                _ => 404,
            },
            ProxyError::BadRequest(_) => 400,
            ProxyError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        classify_io(&e)
    }
}

/// Maps socket errors on the client side of the exchange. Resets, broken
/// pipes and timeouts all mean the client is gone.
pub fn classify_io(e: &std::io::Error) -> ProxyError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::TimedOut => ProxyError::ClientAbort,
        _ => ProxyError::Internal(e.to_string()),
    }
}

/// Maps origin fetch failures to the unreachable taxonomy. The transport
/// library wraps causes several layers deep, so this walks the source chain
/// looking for an I/O error and falls back to message inspection for DNS
/// failures.
pub fn classify_fetch(e: &reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        return ProxyError::Unreachable {
            kind: UnreachableKind::Timeout,
            message: e.to_string(),
        };
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = e.source();
    let mut message = e.to_string();
    while let Some(cause) = source {
        message = cause.to_string();
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            let kind = match io.kind() {
                ErrorKind::ConnectionRefused => UnreachableKind::Refused,
                ErrorKind::TimedOut => UnreachableKind::Timeout,
                ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                    UnreachableKind::NoRoute
                }
                _ => {
                    source = cause.source();
                    continue;
                }
            };
            return ProxyError::Unreachable {
                kind,
                message: io.to_string(),
            };
        }
        source = cause.source();
    }
    let digest = message.to_ascii_lowercase();
    if digest.contains("dns") || digest.contains("resolve") {
        ProxyError::Unreachable {
            kind: UnreachableKind::UnknownHost,
            message,
        }
    } else if e.is_connect() {
        ProxyError::Unreachable {
            kind: UnreachableKind::NoRoute,
            message,
        }
    } else {
        ProxyError::Internal(message)
    }
}
