//! The connection server: bind, accept, classify and hand off to sessions.
//!
//! The accept loop never dies with the process still up: transient accept
//! errors rebind the listener, and out-of-memory conditions prune old
//! sessions and back off before retrying. Denied hosts are dropped before
//! any protocol exchange; hosts with failed authentication history are
//! slowed down proportionally before their session starts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::config::PeergateConfig;
use crate::error::ProxyError;
use crate::lifecycle::Shutdown;
use crate::net::session::{normalize_client_ip, run_session, RegistryGuard, SessionRegistry};
use crate::net::sniff::{sniff_socket, Classification};
use crate::net::tls::{configure_session_socket, ServerStream, TlsContext};
use crate::observability::metrics;
use crate::proxy::cache::{MemoryCache, ProxyCache};
use crate::proxy::client::{AltResolver, NoAltResolver, OriginClient};
use crate::proxy::redirector::Redirector;
use crate::security::{
    AccessTracker, BruteForceTable, DenyHost, OpenBlacklist, PatternBlacklist, UrlBlacklist,
    YellowList,
};

const SNIFF_DEADLINE: Duration = Duration::from_millis(500);
const DEFAULT_CACHE_ENTRIES: usize = 1024;
const OOM_BACKOFF_START: Duration = Duration::from_millis(100);
const OOM_BACKOFF_CAP: Duration = Duration::from_secs(5);
const REBIND_RETRY: Duration = Duration::from_secs(1);

/// Everything sessions and handlers share. Owned here, passed by `Arc`;
/// nothing in it is process-global.
pub struct ServerContext {
    pub config: PeergateConfig,
    pub deny: DenyHost,
    pub brute_force: BruteForceTable,
    pub tracker: AccessTracker,
    pub blacklist: Arc<dyn UrlBlacklist>,
    pub yellow: YellowList,
    pub cache: Arc<dyn ProxyCache>,
    pub origin: OriginClient,
    pub resolver: Arc<dyn AltResolver>,
    pub redirector: Option<Redirector>,
    pub sessions: SessionRegistry,
}

impl ServerContext {
    pub fn new(config: PeergateConfig) -> Result<Self, ProxyError> {
        let blacklist: Arc<dyn UrlBlacklist> = {
            let patterns =
                PatternBlacklist::new(&config.blacklist.hosts, &config.blacklist.patterns);
            if patterns.is_empty() {
                Arc::new(OpenBlacklist)
            } else {
                Arc::new(patterns)
            }
        };
        let redirector = if config.proxy.redirector_path.is_empty() {
            None
        } else {
            match Redirector::spawn(&config.proxy.redirector_path) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(
                        path = %config.proxy.redirector_path,
                        error = %e,
                        "redirector unavailable, continuing without it"
                    );
                    None
                }
            }
        };
        Ok(Self {
            deny: DenyHost::new(config.server.block_attack),
            brute_force: BruteForceTable::new(),
            tracker: AccessTracker::new(&config.tracker),
            blacklist,
            yellow: YellowList::new(&config.proxy.yellow_list),
            cache: Arc::new(MemoryCache::new(DEFAULT_CACHE_ENTRIES)),
            origin: OriginClient::new(&config.proxy)?,
            resolver: Arc::new(NoAltResolver),
            redirector,
            sessions: SessionRegistry::new(),
            config,
        })
    }
}

/// Resolves an address specification to a bindable socket address.
pub fn resolve_bind_address(spec: &str) -> std::io::Result<SocketAddr> {
    if let Ok(port) = spec.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Some(rest) = spec.strip_prefix('#') {
        let (iface, port) = rest.split_once(':').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("interface spec '{spec}' needs a port"),
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad port in '{spec}'"),
            )
        })?;
        let ip = interface_ipv4(iface).unwrap_or_else(|| {
            tracing::warn!(iface, "interface not found, binding unspecified");
            Ipv4Addr::UNSPECIFIED
        });
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }
    spec.parse::<SocketAddr>().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unparseable bind address '{spec}'"),
        )
    })
}

#[cfg(unix)]
fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sin.ip());
        }
    }
    None
}

#[cfg(not(unix))]
fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    None
}

/// Listens for connections and spawns a session task per accepted socket.
pub struct ConnectionServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    bind_addr: SocketAddr,
    tls: Option<TlsContext>,
    shutdown: Shutdown,
}

impl ConnectionServer {
    pub async fn bind(
        ctx: Arc<ServerContext>,
        tls: Option<TlsContext>,
        shutdown: Shutdown,
    ) -> std::io::Result<Self> {
        let bind_addr = resolve_bind_address(&ctx.config.server.address)?;
        let listener = TcpListener::bind(bind_addr).await?;
        tracing::info!(
            address = %listener.local_addr()?,
            tls = tls.is_some(),
            "connection server listening"
        );
        Ok(Self {
            ctx,
            listener,
            bind_addr,
            tls,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until shutdown, then aborts all sessions.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut oom_backoff = OOM_BACKOFF_START;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        oom_backoff = OOM_BACKOFF_START;
                        self.handle_accept(socket, peer);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                        let pruned = self.ctx.sessions.terminate_older_than(
                            Duration::from_secs(self.ctx.config.server.session_grace_secs),
                        );
                        tracing::warn!(
                            pruned,
                            backoff_ms = oom_backoff.as_millis() as u64,
                            "accept failed for lack of memory"
                        );
                        tokio::time::sleep(oom_backoff).await;
                        oom_backoff = (oom_backoff * 2).min(OOM_BACKOFF_CAP);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed, rebinding listener");
                        self.rebind().await;
                    }
                },
            }
        }
        self.ctx.sessions.terminate_all();
        tracing::info!("connection server stopped");
    }

    /// Replaces a broken listener socket, retrying until shutdown.
    async fn rebind(&mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::time::sleep(REBIND_RETRY).await;
            if shutdown_rx.try_recv().is_ok() {
                return;
            }
            match TcpListener::bind(self.bind_addr).await {
                Ok(listener) => {
                    tracing::info!(address = %self.bind_addr, "listener rebound");
                    self.listener = listener;
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rebind failed, retrying");
                }
            }
        }
    }

    fn handle_accept(&self, socket: TcpStream, peer: SocketAddr) {
        let client_ip = normalize_client_ip(&peer);

        if self.ctx.deny.is_denied(&client_ip) {
            tracing::debug!(client = %client_ip, "dropping connection from denied host");
            metrics::record_denied_connection();
            return;
        }

        let busy = self.ctx.sessions.len();
        if busy >= self.ctx.config.server.max_busy_sessions {
            let pruned = self.ctx.sessions.terminate_older_than(Duration::from_secs(
                self.ctx.config.server.session_grace_secs,
            ));
            tracing::warn!(busy, pruned, "session ceiling reached, pruned old sessions");
        }

        let linger = Duration::from_secs(self.ctx.config.server.timeout_secs);
        if let Err(e) = configure_session_socket(&socket, linger) {
            tracing::debug!(error = %e, "could not set session socket options");
        }

        let ctx = self.ctx.clone();
        let tls = self.tls.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let id = self.ctx.sessions.next_id();
        let task = tokio::spawn(async move {
            let _guard = RegistryGuard::new(ctx.clone(), id);

            // Hosts with an authentication failure history wait before
            // being served at all.
            let delay = ctx.brute_force.delay_for(&normalize_client_ip(&peer));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let classification = match sniff_socket(&socket, SNIFF_DEADLINE).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(error = %e, "sniff failed, closing connection");
                    return;
                }
            };
            let stream = match classification {
                Classification::Plain => ServerStream::Plain(socket),
                Classification::Tls(variant) => match &tls {
                    Some(tls) => match tls.accept(socket).await {
                        Ok(stream) => {
                            tracing::debug!(?variant, "TLS session established");
                            ServerStream::Tls(Box::new(stream))
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => {
                        tracing::debug!(?variant, "TLS offered but not configured, closing");
                        return;
                    }
                },
            };
            run_session(ctx, stream, peer, shutdown_rx).await;
        });
        self.ctx
            .sessions
            .register(id, client_ip, task.abort_handle());
    }
}
