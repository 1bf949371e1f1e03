//! Gateway configuration: TOML file + CLI overrides.

use courier_core::{CourierError, CourierResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub broker: BrokerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Messages accepted per session key before a new handshake is required.
    #[serde(default = "default_nonce_limit")]
    pub nonce_limit: usize,
    /// Honour the `?user=` upgrade parameter as the registry key. Only safe
    /// behind a proxy that authenticates the user and sets the parameter.
    #[serde(default = "default_trust_user_param")]
    pub trust_user_param: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            control_port: default_control_port(),
            metrics_port: default_metrics_port(),
            max_frame_size: default_max_frame_size(),
            outbound_buffer: default_outbound_buffer(),
            nonce_limit: default_nonce_limit(),
            trust_user_param: default_trust_user_param(),
        }
    }
}

/// `[pool]` section: sizing of the broker forwarding pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_scale_interval_ms")]
    pub scale_interval_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_size: default_queue_size(),
            scale_interval_ms: default_scale_interval_ms(),
        }
    }
}

/// `[broker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8881
}
fn default_control_port() -> u16 {
    4445
}
fn default_metrics_port() -> u16 {
    4444
}
fn default_max_frame_size() -> usize {
    1_048_576
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_nonce_limit() -> usize {
    crate::session::DEFAULT_NONCE_LIMIT
}
fn default_trust_user_param() -> bool {
    true
}
fn default_min_workers() -> usize {
    2
}
fn default_max_workers() -> usize {
    16
}
fn default_queue_size() -> usize {
    1024
}
fn default_scale_interval_ms() -> u64 {
    2000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Sizing for a [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub scale_interval: Duration,
}

impl PoolConfig {
    /// Reject sizes the pool cannot honour.
    pub fn validate(&self) -> CourierResult<()> {
        if self.min_workers == 0 {
            return Err(CourierError::Other("pool.min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(CourierError::Other(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_size == 0 {
            return Err(CourierError::Other("pool.queue_size must be at least 1".into()));
        }
        if self.scale_interval.is_zero() {
            return Err(CourierError::Other("pool.scale_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub control_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub redis_url: Option<String>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
}

/// Resolved gateway configuration (CLI overrides applied, validated).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub control_port: u16,
    pub metrics_port: u16,
    pub max_frame_size: usize,
    pub outbound_buffer: usize,
    pub nonce_limit: usize,
    pub trust_user_param: bool,
    pub redis_url: String,
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> CourierResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.pool.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: ConfigOverrides) -> Self {
        Self {
            host: file.server.host,
            port: cli.port.unwrap_or(file.server.port),
            control_port: cli.control_port.unwrap_or(file.server.control_port),
            metrics_port: cli.metrics_port.unwrap_or(file.server.metrics_port),
            max_frame_size: file.server.max_frame_size,
            outbound_buffer: file.server.outbound_buffer.max(1),
            nonce_limit: file.server.nonce_limit.max(1),
            trust_user_param: file.server.trust_user_param,
            redis_url: cli.redis_url.unwrap_or(file.broker.redis_url),
            pool: PoolConfig {
                min_workers: cli.min_workers.unwrap_or(file.pool.min_workers),
                max_workers: cli.max_workers.unwrap_or(file.pool.max_workers),
                queue_size: file.pool.queue_size,
                scale_interval: Duration::from_millis(file.pool.scale_interval_ms),
            },
        }
    }
}

/// Parse the TOML text of a config file.
pub fn parse(content: &str) -> CourierResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| CourierError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
