//! Proxy settings loaded from TOML files and the environment

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tlsrelay_core::tracing::LogFormat;
use tlsrelay_core::{ValidateConfig, validators};

use crate::error::{ProxyError, Result};
use crate::proxy::{ListenerConfig, ProxyTimeouts};
use crate::tls::TlsVersion;
use crate::upstream::{UpstreamScheme, UpstreamTarget, UpstreamTls};

/// Files tried, in order, when no explicit config file is given
pub const CONFIG_SEARCH_PATHS: [&str; 3] = [
    "tlsrelay.toml",
    "config/tlsrelay.toml",
    "/etc/tlsrelay/tlsrelay.toml",
];

/// Prefix of overriding environment variables, e.g.
/// `TLSRELAY__UPSTREAM__ADDR=backend:8888`
pub const ENV_PREFIX: &str = "TLSRELAY";

/// Complete settings of the `tlsrelay` binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Serve `/metrics` in Prometheus text format on this address
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// PEM certificate chain
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// PEM private key
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "TlsVersion::all")]
    pub tls_versions: Vec<TlsVersion>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// `host:port` of the backend
    #[serde(default = "default_upstream_addr")]
    pub addr: String,
    /// Speak TLS to the backend
    #[serde(default = "default_true")]
    pub tls: bool,
    /// SNI and verification name, defaults to the host of `addr`
    #[serde(default)]
    pub server_name: Option<String>,
    /// Extra CA bundle trusted for the backend certificate
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Verify the backend certificate
    #[serde(default = "default_true")]
    pub verify: bool,
}

/// Timeouts in whole seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// 0 disables the idle timeout
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> SocketAddr {
    ([0, 0, 0, 0], 443).into()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("proxy.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("proxy.key")
}

fn default_max_connections() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    crate::relay::DEFAULT_BUFFER_SIZE
}

fn default_upstream_addr() -> String {
    "localhost:8888".to_string()
}

fn default_handshake_secs() -> u64 {
    10
}

fn default_connect_secs() -> u64 {
    10
}

fn default_idle_secs() -> u64 {
    600 // 10 minutes
}

fn default_shutdown_secs() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_addr: None,
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            max_connections: default_max_connections(),
            tls_versions: TlsVersion::all(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            addr: default_upstream_addr(),
            tls: true,
            server_name: None,
            ca_path: None,
            verify: true,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            connect_secs: default_connect_secs(),
            idle_secs: default_idle_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

impl From<&TimeoutSettings> for ProxyTimeouts {
    fn from(settings: &TimeoutSettings) -> Self {
        Self {
            handshake: Duration::from_secs(settings.handshake_secs),
            connect: Duration::from_secs(settings.connect_secs),
            idle: (settings.idle_secs > 0).then(|| Duration::from_secs(settings.idle_secs)),
            shutdown: Duration::from_secs(settings.shutdown_secs),
        }
    }
}

impl ProxySettings {
    /// Load from the first config files found in [`CONFIG_SEARCH_PATHS`] and
    /// the environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let mut builder = Self::defaults_builder()?;

        for path in &CONFIG_SEARCH_PATHS {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        builder
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    /// Load from a specific config file, with environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        Self::defaults_builder()?
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    fn defaults_builder() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&ProxySettings::default())?))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Read the certificate, key and CA files and build the proxy config
    pub async fn listener_config(&self) -> Result<ListenerConfig> {
        let cert_chain_pem = read_pem(&self.listener.cert_path, "certificate").await?;
        let private_key_pem = read_pem(&self.listener.key_path, "private key").await?;

        let scheme = if self.upstream.tls {
            let ca_pem = match &self.upstream.ca_path {
                Some(path) => Some(read_pem(path, "upstream CA").await?),
                None => None,
            };
            UpstreamScheme::Tls(UpstreamTls {
                server_name: self.upstream.server_name.clone(),
                ca_pem,
                verify: self.upstream.verify,
            })
        } else {
            UpstreamScheme::Plain
        };

        Ok(ListenerConfig {
            bind_addr: self.listener.bind_addr,
            cert_chain_pem,
            private_key_pem,
            tls_versions: self.listener.tls_versions.clone(),
            upstream: UpstreamTarget {
                addr: self.upstream.addr.clone(),
                scheme,
            },
            timeouts: ProxyTimeouts::from(&self.timeouts),
            max_connections: self.listener.max_connections,
            buffer_size: self.listener.buffer_size,
        })
    }
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        ProxyError::Config(format!("Failed to read {what} from {}: {e}", path.display()))
    })
}

impl ValidateConfig for ProxySettings {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        validators::validate_one_of(
            &self.server.log_level,
            &["trace", "debug", "info", "warn", "error"],
            "server.log_level",
        )?;

        validators::validate_port(self.listener.bind_addr.port(), "listener.bind_addr")?;
        validators::validate_not_empty(
            &self.listener.cert_path.to_string_lossy(),
            "listener.cert_path",
        )?;
        validators::validate_not_empty(
            &self.listener.key_path.to_string_lossy(),
            "listener.key_path",
        )?;
        validators::validate_range(
            self.listener.max_connections,
            1,
            100_000,
            "listener.max_connections",
        )?;
        validators::validate_range(
            self.listener.buffer_size,
            1024,
            1024 * 1024,
            "listener.buffer_size",
        )?;
        if self.listener.tls_versions.is_empty() {
            return Err(ConfigError::Message(
                "listener.tls_versions: at least one version is required".to_string(),
            ));
        }

        validators::validate_host_port(&self.upstream.addr, "upstream.addr")?;
        if let Some(name) = &self.upstream.server_name {
            validators::validate_not_empty(name, "upstream.server_name")?;
        }

        validators::validate_range(self.timeouts.handshake_secs, 1, 300, "timeouts.handshake_secs")?;
        validators::validate_range(self.timeouts.connect_secs, 1, 300, "timeouts.connect_secs")?;
        // 0 disables the idle timeout
        validators::validate_range(self.timeouts.idle_secs, 0, 86_400, "timeouts.idle_secs")?;
        validators::validate_range(self.timeouts.shutdown_secs, 0, 3600, "timeouts.shutdown_secs")?;

        Ok(())
    }
}
