use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub rate_limit: RateLimitConfig,
    pub relay: RelayConfig,
    pub capability_sync: CapabilitySyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Connect to the local container engine at startup. When disabled (or
    /// when the engine is unreachable) lifecycle operations fail fast with
    /// a runtime-unavailable error.
    pub enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per second to each server's bucket.
    pub rate: f64,
    /// Maximum bucket size.
    pub burst: f64,
    pub sweep_interval_secs: u64,
    pub idle_evict_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 50.0,
            burst: 100.0,
            sweep_interval_secs: 300,
            idle_evict_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySyncConfig {
    pub warmup_secs: u64,
    pub dial_attempts: u32,
    pub dial_backoff_secs: u64,
    pub read_timeout_secs: u64,
    pub read_attempts: u32,
}

impl Default for CapabilitySyncConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 2,
            dial_attempts: 5,
            dial_backoff_secs: 1,
            read_timeout_secs: 2,
            read_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        let config = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse TOML config: {}", e)))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config("Server port cannot be 0".to_string()));
        }

        if self.rate_limit.rate <= 0.0 {
            return Err(GatewayError::Config(
                "Rate limit rate must be positive".to_string(),
            ));
        }

        if self.rate_limit.burst < 1.0 {
            return Err(GatewayError::Config(
                "Rate limit burst must be at least 1".to_string(),
            ));
        }

        if self.capability_sync.dial_attempts == 0 || self.capability_sync.read_attempts == 0 {
            return Err(GatewayError::Config(
                "Capability sync attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connect_timeout_secs)
    }

    pub fn rate_limit_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.sweep_interval_secs)
    }

    pub fn rate_limit_idle_eviction(&self) -> Duration {
        Duration::from_secs(self.rate_limit.idle_evict_secs)
    }
}
