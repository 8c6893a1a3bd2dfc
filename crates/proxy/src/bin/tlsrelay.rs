//! tlsrelay - TLS-terminating forwarding proxy

use anyhow::Result;
use axum::{Router, routing::get};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tlsrelay::config::ProxySettings;
use tlsrelay::TlsProxy;
use tlsrelay_core::ValidateConfig;
use tlsrelay_core::tracing::{
    config::InstrumentationConfig, init::init_tracing, metrics::Metrics,
    prometheus::export_prometheus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Exit status when sessions had to be force-closed at the shutdown deadline
const EXIT_FORCED: u8 = 2;

/// TLS-terminating proxy forwarding every connection to one fixed upstream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address, overrides listener.bind_addr
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream host:port, overrides upstream.addr
    #[arg(long)]
    upstream: Option<String>,

    /// Connect to the upstream over plain TCP instead of TLS
    #[arg(long)]
    upstream_plain: bool,
}

impl Cli {
    fn apply(&self, settings: &mut ProxySettings) {
        if let Some(listen) = self.listen {
            settings.listener.bind_addr = listen;
        }
        if let Some(upstream) = &self.upstream {
            settings.upstream.addr = upstream.clone();
        }
        if self.upstream_plain {
            settings.upstream.tls = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("tlsrelay failed: {:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => ProxySettings::load_from_file(path)?,
        None => ProxySettings::load()?,
    };
    cli.apply(&mut settings);
    settings.validate()?;

    let instrumentation_config = InstrumentationConfig {
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| settings.server.log_level.clone()),
        format: settings.server.log_format,
        ..Default::default()
    };
    init_tracing(&instrumentation_config)?;

    info!("Starting tlsrelay");
    debug!("Configuration: {:#?}", settings);

    let listener_config = settings.listener_config().await?;
    let proxy = TlsProxy::start(listener_config).await?;
    let metrics = proxy.metrics();

    let metrics_handle = match settings.server.metrics_addr {
        Some(addr) => Some(serve_metrics(addr, metrics.clone()).await?),
        None => {
            info!("Metrics server not configured (set server.metrics_addr to enable)");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let accept_loop = proxy.run(shutdown.clone());
    tokio::pin!(accept_loop);

    let result = tokio::select! {
        result = &mut accept_loop => result,
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            info!("Shutting down, draining sessions...");
            shutdown.cancel();
            accept_loop.await
        }
    };

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    metrics.log_all();

    let report = result?;
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FORCED))
    }
}

async fn serve_metrics(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<JoinHandle<()>> {
    let router = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { export_prometheus(&metrics) }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Prometheus metrics endpoint available at http://{}/metrics", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Metrics server error: {}", e);
        }
    }))
}

/// Resolves on ctrl-c, or SIGTERM on Unix
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
