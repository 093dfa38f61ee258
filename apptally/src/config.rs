use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::consolidator::ConsolidatorConfig;
use crate::core::error::{Result, TallyError};
use crate::core::KVConfig;

/// Upper bound for `consolidator.counter_ttl_secs` (one year)
pub const MAX_COUNTER_TTL_SECS: u64 = 365 * 24 * 3600;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppTallyConfig {
    pub consolidator: ConsolidatorConfig,
    pub kv_store: KVStoreConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KVStoreConfig {
    pub ttl_cleanup_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between periodic flushes, 0 disables
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for KVStoreConfig {
    fn default() -> Self {
        Self {
            ttl_cleanup_interval_ms: 1000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl AppTallyConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| TallyError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppTallyConfig =
            serde_yaml::from_str(content).map_err(|e| TallyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TallyError::Config(e.to_string()))
    }

    /// Reject settings the consolidator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.consolidator.key_prefix.is_empty() {
            return Err(TallyError::Config(
                "consolidator.key_prefix must not be empty".to_string(),
            ));
        }
        if self.consolidator.counter_ttl_secs == 0 {
            return Err(TallyError::Config(
                "consolidator.counter_ttl_secs must be positive".to_string(),
            ));
        }
        if self.consolidator.counter_ttl_secs > MAX_COUNTER_TTL_SECS {
            return Err(TallyError::Config(format!(
                "consolidator.counter_ttl_secs must be at most {}",
                MAX_COUNTER_TTL_SECS
            )));
        }
        if self.kv_store.ttl_cleanup_interval_ms == 0 {
            return Err(TallyError::Config(
                "kv_store.ttl_cleanup_interval_ms must be positive".to_string(),
            ));
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(TallyError::Config(format!(
                "logging.format must be json or pretty, got {}",
                other
            ))),
        }
    }

    /// Convert to KVConfig
    pub fn to_kv_config(&self) -> KVConfig {
        KVConfig {
            ttl_cleanup_interval_ms: self.kv_store.ttl_cleanup_interval_ms,
        }
    }

    /// Interval of the periodic flush task, zero when disabled
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.flush_interval_secs)
    }
}
