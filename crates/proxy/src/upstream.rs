//! Outbound connections to the fixed upstream target

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::debug;

use crate::error::Result;
use crate::tls;

/// Where every session is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// `host:port`, resolved on every connect
    pub addr: String,
    pub scheme: UpstreamScheme,
}

impl UpstreamTarget {
    /// Plain TCP upstream
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            scheme: UpstreamScheme::Plain,
        }
    }

    /// TLS upstream with default verification against the Mozilla roots
    pub fn tls(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            scheme: UpstreamScheme::Tls(UpstreamTls::default()),
        }
    }

    /// Host part of the address, without port or IPv6 brackets
    pub fn host(&self) -> &str {
        let host = match self.addr.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => self.addr.as_str(),
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamScheme {
    Plain,
    Tls(UpstreamTls),
}

/// Client-side TLS options for the upstream leg
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamTls {
    /// SNI and verification name; the target host when unset
    pub server_name: Option<String>,
    /// Extra trust anchors (PEM) on top of the Mozilla roots
    pub ca_pem: Option<Vec<u8>>,
    /// Verify the upstream certificate chain and name
    pub verify: bool,
}

impl Default for UpstreamTls {
    fn default() -> Self {
        Self {
            server_name: None,
            ca_pem: None,
            verify: true,
        }
    }
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("server_name", &self.server_name)
            .field("ca_pem", &self.ca_pem.as_ref().map(|pem| pem.len()))
            .field("verify", &self.verify)
            .finish()
    }
}

/// Why an upstream connection could not be established
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Opens connections to the upstream target
///
/// Built once at startup; the TLS connector and server name are validated
/// then so that a bad upstream TLS setting is a startup error.
#[derive(Clone)]
pub struct UpstreamConnector {
    addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(target: &UpstreamTarget, connect_timeout: Duration) -> Result<Self> {
        let tls = match &target.scheme {
            UpstreamScheme::Plain => None,
            UpstreamScheme::Tls(opts) => {
                let connector = tls::build_connector(opts.ca_pem.as_deref(), opts.verify)?;
                let name = opts.server_name.as_deref().unwrap_or_else(|| target.host());
                Some((connector, tls::server_name(name)?))
            }
        };

        Ok(Self {
            addr: target.addr.clone(),
            tls,
            connect_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect, including the TLS handshake, within the connect timeout
    pub async fn connect(&self) -> std::result::Result<UpstreamStream, UpstreamError> {
        tokio::time::timeout(self.connect_timeout, self.establish())
            .await
            .map_err(|_| UpstreamError::Timeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })?
    }

    async fn establish(&self) -> std::result::Result<UpstreamStream, UpstreamError> {
        let tcp = TcpStream::connect(self.addr.as_str())
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        // Interactive protocols depend on small writes going out immediately
        let _ = tcp.set_nodelay(true);

        let Some((connector, server_name)) = &self.tls else {
            debug!(upstream = %self.addr, "Upstream connected");
            return Ok(UpstreamStream::Plain(tcp));
        };

        let stream = connector
            .connect(server_name.clone(), tcp)
            .await
            .map_err(|source| UpstreamError::Tls {
                addr: self.addr.clone(),
                source,
            })?;
        debug!(upstream = %self.addr, "Upstream connected over TLS");
        Ok(UpstreamStream::Tls(Box::new(stream)))
    }
}

/// Either a plain or a TLS upstream connection
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
