//! Shared helpers for the end-to-end tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use tlsrelay::{
    ListenerConfig, ProxyTimeouts, SessionEvent, SessionObserver, SessionSummary, TlsVersion,
    UpstreamTarget,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsConnector, client};

/// How long any single step of a test may take before it counts as hung
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: CertificateDer<'static>,
}

pub fn generate_cert(names: &[&str]) -> TestCert {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: signing_key.serialize_pem(),
        der: cert.der().clone(),
    }
}

/// Proxy config on an ephemeral loopback port with short timeouts
pub fn proxy_config(cert: &TestCert, upstream: UpstreamTarget) -> ListenerConfig {
    let mut config = ListenerConfig::new(
        ([127, 0, 0, 1], 0).into(),
        cert.cert_pem.as_bytes(),
        cert.key_pem.as_bytes(),
        upstream,
    );
    config.timeouts = ProxyTimeouts::for_testing();
    config
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client connector trusting only `ca`
pub fn client_connector(ca: &TestCert) -> TlsConnector {
    client_connector_with_versions(ca, rustls::DEFAULT_VERSIONS)
}

pub fn client_connector_with_versions(
    ca: &TestCert,
    versions: &[&'static SupportedProtocolVersion],
) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(ca.der.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(versions)
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn connect_client(
    addr: SocketAddr,
    connector: &TlsConnector,
) -> std::io::Result<client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
}

/// Read until the peer closes; a missing close_notify also counts
pub async fn read_until_closed<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(STEP_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return received,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Err(_) => panic!("peer did not close within {STEP_TIMEOUT:?}"),
        }
    }
}

/// Upstream that reads a request until EOF, then answers "PONG" and closes
pub async fn ping_pong_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                if socket.read_to_end(&mut request).await.is_ok() && request == b"PING" {
                    let _ = socket.write_all(b"PONG").await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, accepted)
}

/// Upstream that echoes every byte back and half-closes on EOF
pub async fn echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    (addr, accepted)
}

/// Echo upstream behind TLS with the given certificate
pub async fn tls_echo_upstream(cert: &TestCert) -> SocketAddr {
    let acceptor = tlsrelay::tls::build_acceptor(
        cert.cert_pem.as_bytes(),
        cert.key_pem.as_bytes(),
        &TlsVersion::all(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(socket).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// Upstream that accepts TCP but never sends a byte
///
/// Accepted sockets are handed to the receiver, which keeps them open.
pub async fn silent_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            if tx.send(socket).is_err() {
                return;
            }
        }
    });

    (addr, rx)
}

/// An address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Session events delivered through a channel
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventLog {
    pub async fn next(&mut self) -> SessionEvent {
        tokio::time::timeout(STEP_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("observer dropped")
    }

    /// Skip ahead to the next `Closed` event, returning it and the events before it
    pub async fn closed(&mut self) -> (SessionSummary, Vec<SessionEvent>) {
        let mut before = Vec::new();
        loop {
            match self.next().await {
                SessionEvent::Closed(summary) => return (summary, before),
                other => before.push(other),
            }
        }
    }
}

pub fn recording_observer() -> (Arc<dyn SessionObserver>, EventLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: Arc<dyn SessionObserver> = Arc::new(move |event: &SessionEvent| {
        let _ = tx.send(event.clone());
    });
    (observer, EventLog { rx })
}
