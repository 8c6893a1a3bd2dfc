//! Session lifecycle events and the proxy's own metrics

use std::net::SocketAddr;
use std::sync::Arc;

use tlsrelay_core::tracing::metrics::{Counter, Gauge, Histogram, Metrics};
use tracing::{debug, info, warn};

use crate::error::is_connection_closed_error;
use crate::session::{CloseReason, SessionId, SessionSummary};

/// Discrete lifecycle events, one `Opened` and one `Closed` per session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened {
        id: SessionId,
        peer_addr: SocketAddr,
    },
    HandshakeFailed {
        id: SessionId,
        peer_addr: SocketAddr,
        error: Arc<std::io::Error>,
    },
    UpstreamFailed {
        id: SessionId,
        upstream: String,
        error: String,
    },
    Closed(SessionSummary),
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Opened { id, .. }
            | SessionEvent::HandshakeFailed { id, .. }
            | SessionEvent::UpstreamFailed { id, .. } => *id,
            SessionEvent::Closed(summary) => summary.id,
        }
    }
}

/// Receives session events
///
/// Called inline from session tasks, so implementations must not block.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_event(&self, event: &SessionEvent);
}

impl<F> SessionObserver for F
where
    F: Fn(&SessionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &SessionEvent) {
        self(event)
    }
}

/// Observer that writes every event to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Opened { id, peer_addr } => {
                debug!(session = %id, peer = %peer_addr, "Session opened");
            }
            SessionEvent::HandshakeFailed {
                id,
                peer_addr,
                error,
            } => {
                if is_connection_closed_error(error) {
                    debug!(session = %id, peer = %peer_addr, "Client went away during handshake: {}", error);
                } else {
                    warn!(session = %id, peer = %peer_addr, "TLS handshake failed: {}", error);
                }
            }
            SessionEvent::UpstreamFailed {
                id,
                upstream,
                error,
            } => {
                warn!(session = %id, upstream = %upstream, "Upstream unreachable: {}", error);
            }
            SessionEvent::Closed(summary) => {
                info!(
                    session = %summary.id,
                    peer = %summary.peer_addr,
                    reason = %summary.reason,
                    client_to_upstream = summary.client_to_upstream,
                    upstream_to_client = summary.upstream_to_client,
                    duration_ms = summary.duration.as_millis() as u64,
                    "Session closed"
                );
                if let Some(error) = &summary.error {
                    debug!(session = %summary.id, "Close detail: {}", error);
                }
            }
        }
    }
}

/// Metric handles for one proxy instance
#[derive(Clone)]
pub(crate) struct ProxyStats {
    metrics: Arc<Metrics>,
    pub sessions_total: Counter,
    pub sessions_active: Gauge,
    pub bytes_client_to_upstream: Counter,
    pub bytes_upstream_to_client: Counter,
    pub accept_errors: Counter,
    pub session_duration: Histogram,
}

impl ProxyStats {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions_total: metrics.counter("tlsrelay_sessions_total"),
            sessions_active: metrics.gauge("tlsrelay_sessions_active"),
            bytes_client_to_upstream: metrics.counter("tlsrelay_bytes_client_to_upstream"),
            bytes_upstream_to_client: metrics.counter("tlsrelay_bytes_upstream_to_client"),
            accept_errors: metrics.counter("tlsrelay_accept_errors_total"),
            session_duration: metrics.histogram("tlsrelay_session_duration_seconds"),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn session_opened(&self) {
        self.sessions_total.increment();
        self.sessions_active.increment();
    }

    pub fn session_closed(&self, summary: &SessionSummary) {
        self.sessions_active.decrement();
        self.bytes_client_to_upstream.add(summary.client_to_upstream);
        self.bytes_upstream_to_client.add(summary.upstream_to_client);
        self.session_duration.observe_duration(summary.duration);
        self.closed_counter(summary.reason).increment();
    }

    fn closed_counter(&self, reason: CloseReason) -> Counter {
        self.metrics
            .counter(&format!("tlsrelay_sessions_closed_{}", reason.as_str()))
    }
}
