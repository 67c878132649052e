//! Session lifecycle: one task per accepted connection.
//!
//! A session reads command lines, dispatches them through an explicit
//! match on the upper-cased command token, and obeys the handler's reply:
//! resume for the next command or terminate. Every live session is listed
//! in the registry so the server can prune old ones when the busy ceiling
//! is reached.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::net::line::LineReader;
use crate::net::props::now_millis;
use crate::net::server::ServerContext;
use crate::net::tls::ServerStream;
use crate::observability::metrics;
use crate::proxy::handler::{HttpdHandler, Reply};

/// Empty command lines tolerated before the session is dropped.
const MAX_EMPTY_COMMANDS: u32 = 10;

/// Registry entry for one live session.
pub struct SessionHandle {
    pub client_ip: String,
    pub started_ms: u64,
    abort: AbortHandle,
}

/// All currently running sessions.
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<u64, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, id: u64, client_ip: String, abort: AbortHandle) {
        self.sessions.insert(
            id,
            SessionHandle {
                client_ip,
                started_ms: now_millis(),
                abort,
            },
        );
    }

    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Aborts sessions older than `grace`, returning how many went.
    pub fn terminate_older_than(&self, grace: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(grace.as_millis() as u64);
        let victims: Vec<u64> = self
            .sessions
            .iter()
            .filter(|e| e.value().started_ms <= cutoff)
            .map(|e| *e.key())
            .collect();
        for id in &victims {
            if let Some((_, handle)) = self.sessions.remove(id) {
                tracing::info!(
                    session = id,
                    client = %handle.client_ip,
                    "terminating old session"
                );
                handle.abort.abort();
            }
        }
        victims.len()
    }

    /// Aborts every session. Used on shutdown.
    pub fn terminate_all(&self) {
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.sessions.remove(&id) {
                handle.abort.abort();
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a session from the registry when its task ends, whether it
/// returned or was aborted.
pub struct RegistryGuard {
    ctx: Arc<ServerContext>,
    id: u64,
}

impl RegistryGuard {
    pub fn new(ctx: Arc<ServerContext>, id: u64) -> Self {
        metrics::record_session_started();
        Self { ctx, id }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.ctx.sessions.remove(self.id);
        metrics::record_session_finished();
    }
}

/// Loopback peers are logged under the name rather than the address.
pub fn normalize_client_ip(peer: &SocketAddr) -> String {
    if peer.ip().is_loopback() {
        "localhost".to_string()
    } else {
        peer.ip().to_string()
    }
}

/// Runs the command loop for one connection until it terminates.
pub async fn run_session(
    ctx: Arc<ServerContext>,
    stream: ServerStream,
    peer: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    let client_ip = normalize_client_ip(&peer);
    let max_line = ctx.config.server.command_max_length;
    let first_timeout = Duration::from_secs(ctx.config.server.timeout_secs);
    let keep_alive = Duration::from_secs(ctx.config.server.keep_alive_secs);

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = LineReader::new(read_half);
    let handler = HttpdHandler::new(ctx.clone(), client_ip.clone());

    let mut commands = 0u32;
    let mut empty_commands = 0u32;

    loop {
        let idle = if commands == 0 { first_timeout } else { keep_alive };
        let line = tokio::select! {
            _ = shutdown.recv() => break,
            read = timeout(idle, reader.read_line(max_line)) => match read {
                Err(_) => {
                    tracing::debug!(client = %client_ip, "session idle timeout");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(client = %client_ip, error = %e, "session read failed");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(line))) => line,
            },
        };
        commands += 1;

        let trimmed = line.trim();
        let (token, args) = match trimmed.split_once(char::is_whitespace) {
            Some((t, a)) => (t.to_ascii_uppercase(), a.trim_start()),
            None => (trimmed.to_ascii_uppercase(), ""),
        };

        let reply = match token.as_str() {
            "" => {
                empty_commands += 1;
                if empty_commands > MAX_EMPTY_COMMANDS {
                    tracing::debug!(client = %client_ip, "too many empty commands");
                    break;
                }
                continue;
            }
            "GET" | "HEAD" => {
                handler
                    .handle_fetch(&token, args, &mut reader, &mut write_half)
                    .await
            }
            "POST" => handler.handle_post(args, &mut reader, &mut write_half).await,
            "CONNECT" => {
                handler.handle_connect(args, reader, write_half).await;
                return;
            }
            other => {
                tracing::info!(client = %client_ip, command = other, "unknown command");
                record_unknown_command(&ctx, &client_ip);
                let answer =
                    "HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                let _ = write_half.write_all(answer.as_bytes()).await;
                Reply::Terminate
            }
        };
        match reply {
            Reply::Resume => continue,
            Reply::Terminate => break,
        }
    }
    let _ = write_half.shutdown().await;
}

/// A command line that is not HTTP reads like a port probe. Remote
/// senders are denied outright; loopback clients only get the 501.
fn record_unknown_command(ctx: &ServerContext, client_ip: &str) {
    if client_ip == "localhost" {
        return;
    }
    ctx.deny.deny(client_ip, "unrecognized command");
}
