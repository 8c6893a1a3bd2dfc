//! TLS-terminating forwarding proxy
//!
//! Accepts TLS connections on one listen address, terminates them with a
//! static certificate/key pair and relays the decrypted bytes to a single
//! fixed upstream target, optionally re-encrypting towards the upstream.
//!
//! - [`TlsProxy::start`] validates TLS material and binds the listener
//! - [`TlsProxy::run`] / [`TlsProxy::spawn`] drive the accept loop
//! - [`ProxyHandle::shutdown`] stops accepting and drains in-flight sessions

pub mod config;
pub mod error;
pub mod observer;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod tls;
pub mod upstream;

pub use error::{ProxyError, Result};
pub use observer::{LoggingObserver, SessionEvent, SessionObserver};
pub use proxy::{DrainReport, ListenerConfig, ProxyHandle, ProxyTimeouts, TlsProxy};
pub use session::{CloseReason, SessionId, SessionState, SessionSummary};
pub use tls::TlsVersion;
pub use upstream::{UpstreamScheme, UpstreamTarget, UpstreamTls};
