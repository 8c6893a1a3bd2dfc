//! Per-connection session handling
//!
//! A session walks `Accepted -> Handshaking -> ConnectingUpstream ->
//! Relaying -> Closed`, jumping straight to `Closed` from any step that
//! fails. It owns both connection handles and drops them before reporting
//! itself closed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::observer::{ProxyStats, SessionEvent, SessionObserver};
use crate::relay::{self, RelayEnd, RelayOptions};
use crate::upstream::UpstreamConnector;

/// Upper bound on the close_notify sent to a client whose upstream failed
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// Lifecycle position; ordered so that transitions only ever move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Accepted,
    Handshaking,
    ConnectingUpstream,
    Relaying,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Both relay directions reached end-of-stream
    Completed,
    HandshakeFailed,
    UpstreamUnreachable,
    RelayError,
    /// Handshake or idle timeout
    Timeout,
    /// Still open when the shutdown deadline passed
    ShutdownTimeout,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::UpstreamUnreachable => "upstream_unreachable",
            CloseReason::RelayError => "relay_error",
            CloseReason::Timeout => "timeout",
            CloseReason::ShutdownTimeout => "shutdown_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of a closed session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    pub reason: CloseReason,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub duration: Duration,
    /// Error behind the close, if any
    pub error: Option<String>,
}

/// Everything a session needs that is shared across sessions
pub(crate) struct SessionContext {
    pub acceptor: TlsAcceptor,
    pub upstream: UpstreamConnector,
    pub handshake_timeout: Duration,
    pub relay: RelayOptions,
    pub observer: Arc<dyn SessionObserver>,
    pub stats: ProxyStats,
    /// Cancelled when the shutdown deadline passes
    pub force_close: CancellationToken,
}

struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    created_at: Instant,
    state: SessionState,
    client_to_upstream: u64,
    upstream_to_client: u64,
}

impl Session {
    fn new(id: SessionId, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            created_at: Instant::now(),
            state: SessionState::Accepted,
            client_to_upstream: 0,
            upstream_to_client: 0,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        trace!(session = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    fn close(mut self, reason: CloseReason, error: Option<String>) -> SessionSummary {
        self.advance(SessionState::Closed);
        SessionSummary {
            id: self.id,
            peer_addr: self.peer_addr,
            reason,
            client_to_upstream: self.client_to_upstream,
            upstream_to_client: self.upstream_to_client,
            duration: self.created_at.elapsed(),
            error,
        }
    }
}

/// Drive one accepted connection to completion
///
/// Every exit path reports exactly one `Closed` event, after both
/// connection handles have been dropped.
pub(crate) async fn handle_session(
    ctx: Arc<SessionContext>,
    id: SessionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> SessionSummary {
    ctx.stats.session_opened();
    ctx.observer.on_event(&SessionEvent::Opened { id, peer_addr });

    let summary = run_session(&ctx, Session::new(id, peer_addr), stream).await;

    ctx.stats.session_closed(&summary);
    ctx.observer.on_event(&SessionEvent::Closed(summary.clone()));
    summary
}

async fn run_session(ctx: &SessionContext, mut session: Session, stream: TcpStream) -> SessionSummary {
    let _ = stream.set_nodelay(true);

    session.advance(SessionState::Handshaking);
    let handshake = tokio::select! {
        result = tokio::time::timeout(ctx.handshake_timeout, ctx.acceptor.accept(stream)) => result,
        _ = ctx.force_close.cancelled() => {
            return session.close(CloseReason::ShutdownTimeout, Some("closed during handshake".into()));
        }
    };
    let mut client = match handshake {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => {
            let error = e.to_string();
            ctx.observer.on_event(&SessionEvent::HandshakeFailed {
                id: session.id,
                peer_addr: session.peer_addr,
                error: Arc::new(e),
            });
            return session.close(CloseReason::HandshakeFailed, Some(error));
        }
        Err(_) => {
            let error = std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no handshake within {:?}", ctx.handshake_timeout),
            );
            let detail = error.to_string();
            ctx.observer.on_event(&SessionEvent::HandshakeFailed {
                id: session.id,
                peer_addr: session.peer_addr,
                error: Arc::new(error),
            });
            return session.close(CloseReason::Timeout, Some(detail));
        }
    };

    if let Some(sni) = client.get_ref().1.server_name() {
        debug!(session = %session.id, sni, "Client handshake complete");
    }

    session.advance(SessionState::ConnectingUpstream);
    let connected = tokio::select! {
        result = ctx.upstream.connect() => result,
        _ = ctx.force_close.cancelled() => {
            drop(client);
            return session.close(CloseReason::ShutdownTimeout, Some("closed while connecting upstream".into()));
        }
    };
    let upstream = match connected {
        Ok(upstream) => upstream,
        Err(e) => {
            let error = e.to_string();
            ctx.observer.on_event(&SessionEvent::UpstreamFailed {
                id: session.id,
                upstream: ctx.upstream.addr().to_string(),
                error: error.clone(),
            });
            let _ = tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, client.shutdown()).await;
            drop(client);
            return session.close(CloseReason::UpstreamUnreachable, Some(error));
        }
    };

    session.advance(SessionState::Relaying);
    let outcome = relay::relay(client, upstream, ctx.relay, &ctx.force_close).await;
    session.client_to_upstream = outcome.client_to_upstream;
    session.upstream_to_client = outcome.upstream_to_client;

    match outcome.end {
        RelayEnd::Completed => session.close(CloseReason::Completed, None),
        RelayEnd::Failed(e) => session.close(CloseReason::RelayError, Some(e.to_string())),
        RelayEnd::Idle => session.close(
            CloseReason::Timeout,
            ctx.relay
                .idle_timeout
                .map(|idle| format!("idle for {idle:?}")),
        ),
        RelayEnd::Cancelled => session.close(CloseReason::ShutdownTimeout, None),
    }
}
