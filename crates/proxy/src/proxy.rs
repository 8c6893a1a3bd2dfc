//! TLS-terminating listener and accept loop

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tlsrelay_core::tracing::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::observer::{LoggingObserver, ProxyStats, SessionObserver};
use crate::relay::{DEFAULT_BUFFER_SIZE, RelayOptions};
use crate::session::{self, CloseReason, SessionContext, SessionId, SessionSummary};
use crate::tls::{self, TlsVersion};
use crate::upstream::{UpstreamConnector, UpstreamTarget};

/// Pause before accepting again after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(unix)]
const EBADF: i32 = 9;

/// Timeouts applied to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimeouts {
    /// Client TLS handshake
    pub handshake: Duration,
    /// Upstream TCP connect plus upstream TLS handshake
    pub connect: Duration,
    /// No bytes in either direction; `None` disables
    pub idle: Option<Duration>,
    /// How long in-flight sessions may keep running after shutdown
    pub shutdown: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            idle: Some(Duration::from_secs(600)),
            shutdown: Duration::from_secs(30),
        }
    }
}

impl ProxyTimeouts {
    /// Short timeouts suitable for testing
    pub fn for_testing() -> Self {
        Self {
            handshake: Duration::from_secs(2),
            connect: Duration::from_secs(2),
            idle: Some(Duration::from_secs(30)),
            shutdown: Duration::from_secs(5),
        }
    }
}

/// Immutable startup configuration of a proxy instance
#[derive(Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// PEM certificate chain, leaf first
    pub cert_chain_pem: Vec<u8>,
    /// PEM private key matching the leaf certificate
    pub private_key_pem: Vec<u8>,
    pub tls_versions: Vec<TlsVersion>,
    pub upstream: UpstreamTarget,
    pub timeouts: ProxyTimeouts,
    pub max_connections: usize,
    pub buffer_size: usize,
}

impl ListenerConfig {
    pub fn new(
        bind_addr: SocketAddr,
        cert_chain_pem: impl Into<Vec<u8>>,
        private_key_pem: impl Into<Vec<u8>>,
        upstream: UpstreamTarget,
    ) -> Self {
        Self {
            bind_addr,
            cert_chain_pem: cert_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
            tls_versions: TlsVersion::all(),
            upstream,
            timeouts: ProxyTimeouts::default(),
            max_connections: 1000,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("cert_chain_pem", &format_args!("<{} bytes>", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("tls_versions", &self.tls_versions)
            .field("upstream", &self.upstream)
            .field("timeouts", &self.timeouts)
            .field("max_connections", &self.max_connections)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// Result of a shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions that finished on their own during the drain
    pub drained: usize,
    /// Sessions force-closed at the deadline
    pub forced: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

/// A bound, TLS-ready proxy that has not started accepting yet
pub struct TlsProxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    max_connections: usize,
    shutdown_timeout: Duration,
}

impl TlsProxy {
    /// Validate TLS material and bind the listen socket, logging session
    /// events through tracing
    pub async fn start(config: ListenerConfig) -> Result<Self> {
        Self::start_with_observer(config, Arc::new(LoggingObserver)).await
    }

    /// Validate TLS material and bind the listen socket
    ///
    /// The socket is bound only once the certificate, key and upstream TLS
    /// settings are valid, so a configuration error never holds the port.
    pub async fn start_with_observer(
        config: ListenerConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be at least 1".into()));
        }

        let acceptor = tls::build_acceptor(
            &config.cert_chain_pem,
            &config.private_key_pem,
            &config.tls_versions,
        )?;
        let upstream = UpstreamConnector::new(&config.upstream, config.timeouts.connect)?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("TLS proxy listening on {} -> {}", local_addr, config.upstream.addr);

        let ctx = SessionContext {
            acceptor,
            upstream,
            handshake_timeout: config.timeouts.handshake,
            relay: RelayOptions {
                buffer_size: config.buffer_size,
                idle_timeout: config.timeouts.idle,
            },
            observer,
            stats: ProxyStats::new(Arc::new(Metrics::new())),
            force_close: CancellationToken::new(),
        };

        Ok(Self {
            listener,
            local_addr,
            ctx: Arc::new(ctx),
            max_connections: config.max_connections,
            shutdown_timeout: config.timeouts.shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Metrics registry of this proxy instance
    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.stats.metrics().clone()
    }

    /// Accept connections until `shutdown` is cancelled, then drain
    ///
    /// Each session runs on its own task. Returns
    /// [`ProxyError::ListenerClosed`] if the listener fails for good; sessions
    /// still in flight are drained first in that case too.
    pub async fn run(self, shutdown: CancellationToken) -> Result<DrainReport> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut sessions = JoinSet::new();
        let mut next_id = 0u64;

        let result = loop {
            while let Some(joined) = sessions.try_join_next() {
                log_join_error(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    next_id += 1;
                    let id = SessionId::new(next_id);
                    let ctx = self.ctx.clone();

                    sessions.spawn(
                        async move {
                            let summary = session::handle_session(ctx, id, stream, peer_addr).await;
                            drop(permit);
                            summary
                        }
                        .instrument(tracing::info_span!("session", session = %id, %peer_addr)),
                    );
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    error!("Listener failed, no longer accepting: {}", e);
                    break Err(ProxyError::ListenerClosed(e));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    self.ctx.stats.accept_errors.increment();
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        };

        let Self {
            listener,
            local_addr,
            ctx,
            shutdown_timeout,
            ..
        } = self;
        drop(listener);
        info!("Stopped accepting on {}", local_addr);

        let report = drain(sessions, &ctx, shutdown_timeout).await;
        if report.forced > 0 {
            warn!(
                drained = report.drained,
                forced = report.forced,
                "Shutdown finished with force-closed sessions"
            );
        } else {
            info!(drained = report.drained, "Shutdown finished cleanly");
        }

        result.map(|()| report)
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> ProxyHandle {
        let shutdown = CancellationToken::new();
        let local_addr = self.local_addr;
        let stats = self.ctx.stats.clone();
        let task = tokio::spawn(self.run(shutdown.clone()));

        ProxyHandle {
            local_addr,
            shutdown,
            task,
            stats,
        }
    }
}

/// Handle to a proxy running on a background task
pub struct ProxyHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<DrainReport>>,
    stats: ProxyStats,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.stats.metrics().clone()
    }

    /// Sessions currently open
    pub fn active_sessions(&self) -> i64 {
        self.stats.sessions_active.get()
    }

    /// Stop accepting, close the listener and drain in-flight sessions
    pub async fn shutdown(self) -> Result<DrainReport> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the accept loop to end without requesting shutdown
    pub async fn wait(self) -> Result<DrainReport> {
        self.task.await?
    }
}

/// Wait for in-flight sessions until the deadline, then force-close the rest
async fn drain(
    mut sessions: JoinSet<SessionSummary>,
    ctx: &SessionContext,
    shutdown_timeout: Duration,
) -> DrainReport {
    let mut report = DrainReport::default();

    // Sessions that ended before shutdown was requested
    while let Some(joined) = sessions.try_join_next() {
        log_join_error(joined);
    }
    if sessions.is_empty() {
        return report;
    }

    info!(
        active = sessions.len(),
        "Draining sessions for up to {:?}", shutdown_timeout
    );
    // No deadline when the timeout runs past the clock's range
    let deadline = Instant::now().checked_add(shutdown_timeout);
    loop {
        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, sessions.join_next()).await,
            None => Ok(sessions.join_next().await),
        };
        match next {
            Ok(Some(joined)) => {
                log_join_error(joined);
                report.drained += 1;
            }
            Ok(None) => return report,
            Err(_) => break,
        }
    }

    warn!(
        remaining = sessions.len(),
        "Shutdown deadline passed, force-closing sessions"
    );
    ctx.force_close.cancel();
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(summary) if summary.reason == CloseReason::ShutdownTimeout => report.forced += 1,
            Ok(_) => report.drained += 1,
            Err(e) => {
                log_join_error(Err(e));
                report.forced += 1;
            }
        }
    }

    report
}

fn log_join_error(joined: std::result::Result<SessionSummary, JoinError>) {
    match joined {
        Ok(summary) => debug!(session = %summary.id, "Session task finished"),
        Err(e) => error!("Session task failed: {}", e),
    }
}

/// Listener errors after which no further connection can be accepted
fn is_fatal_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
    ) {
        return true;
    }

    #[cfg(unix)]
    if e.raw_os_error() == Some(EBADF) {
        return true;
    }

    false
}
