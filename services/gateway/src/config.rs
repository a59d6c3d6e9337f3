//! Configuration types and loading
//!
//! Everything is optional: a missing config file means pure defaults, and
//! every section has per-field defaults so partial files work. Runtime
//! mutable knobs (rate limit, refresh, history) start from here and can be
//! changed later through the admin surface.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use codeassist_pool::{HistoryConfig, RateLimitConfig, RefreshConfig};
use serde::Deserialize;
use tracing::info;

/// Root configuration.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub endpoints: EndpointsConfig,
    pub rate_limit: RateLimitConfig,
    pub refresh: RefreshConfig,
    pub quota_scheduler: SchedulerConfig,
    pub history: HistoryConfig,
}

/// Listener and storage settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Directory for the registry, quota cache, and priority files
    pub data_dir: PathBuf,
    /// Well-known token file adopted when the registry is empty
    pub default_token_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8990"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8990))),
            data_dir: PathBuf::from("data"),
            default_token_path: None,
        }
    }
}

/// External endpoints the provider clients talk to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub token_url: String,
    pub usage_url: String,
    pub upstream_url: String,
    pub summarizer_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            token_url: "https://oidc.us-east-1.amazonaws.com/token".into(),
            usage_url: "https://codewhisperer.us-east-1.amazonaws.com/getUsageLimits".into(),
            upstream_url: "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse"
                .into(),
            summarizer_url: "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse"
                .into(),
        }
    }
}

/// Quota scheduler knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub update_interval_secs: u64,
    pub cache_max_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            cache_max_age_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file is not an
    /// error; the gateway starts on defaults.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Resolve the config path: CLI flag, then `GATEWAY_CONFIG` env var,
    /// then `gateway.toml` in the working directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("gateway.toml")
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.gateway.data_dir.join("accounts.json")
    }

    pub fn quota_cache_path(&self) -> PathBuf {
        self.gateway.data_dir.join("quota_cache.json")
    }

    pub fn priority_path(&self) -> PathBuf {
        self.gateway.data_dir.join("priority.json")
    }
}
