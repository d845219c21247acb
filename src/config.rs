use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub steam: SteamConfig,
}

// ---------------------------------------------------------------------------
// Proxy listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the cache listener (e.g. `0.0.0.0:80`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Socket address for the Prometheus listener.  `null` disables it.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: Option<String>,
    /// How long in-flight requests may run after a shutdown signal.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl ProxyConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            metrics_listen: default_metrics_listen(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:80".to_string()
}

fn default_metrics_listen() -> Option<String> {
    Some("0.0.0.0:9090".to_string())
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Local storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for cached depot content.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

// ---------------------------------------------------------------------------
// Upstream origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// URL scheme used both for origin fetches and skip redirects.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// `User-Agent` sent with every origin request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// TCP/TLS connect timeout for origin requests, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_user_agent() -> String {
    "lancache/0.0.1 (+https://trnet.cc/lancache)".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Steam depots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SteamConfig {
    /// Depot ids whose content is persisted locally.
    #[serde(default)]
    pub depots: Vec<u32>,
    /// Cache every depot regardless of `depots`.
    #[serde(default)]
    pub cache_all: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    config
        .proxy
        .http_listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.proxy.http_listen))?;
    if let Some(ref addr) = config.proxy.metrics_listen {
        addr.parse::<SocketAddr>()
            .with_context(|| format!("invalid metrics_listen address: {addr}"))?;
    }
    anyhow::ensure!(
        config.proxy.shutdown_grace_secs > 0,
        "shutdown_grace_secs must be greater than zero"
    );
    anyhow::ensure!(
        matches!(config.upstream.scheme.as_str(), "http" | "https"),
        "upstream scheme must be http or https, got {:?}",
        config.upstream.scheme
    );
    Ok(())
}
