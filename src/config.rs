//! Pipeline configuration
//!
//! Loaded from a JSON file or from `SENTINEL_*` environment variables.
//! Unset fields fall back to defaults.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_STORE_TIMEOUT_MS: &str = "SENTINEL_STORE_TIMEOUT_MS";
const ENV_PAGE_LIMIT: &str = "SENTINEL_PAGE_LIMIT";
const ENV_FAILURE_LOG_CAPACITY: &str = "SENTINEL_FAILURE_LOG_CAPACITY";

/// Runtime settings for `AuditPipeline`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Deadline for each store round trip, in milliseconds
    pub store_timeout_ms: u64,

    /// Largest page returned by list queries
    pub page_limit: usize,

    /// Degraded evaluations kept in memory (0 = unbounded)
    pub failure_log_capacity: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            page_limit: 200,
            failure_log_capacity: 1_000,
        }
    }
}

impl SentinelConfig {
    /// Load from a JSON file; a missing file yields the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file absent, using defaults");
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: SentinelConfig = serde_json::from_str(&json).map_err(|e| {
            AuditError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Load from `SENTINEL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_STORE_TIMEOUT_MS) {
            config.store_timeout_ms = parse_var(ENV_STORE_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_PAGE_LIMIT) {
            config.page_limit = parse_var(ENV_PAGE_LIMIT, &value)?;
        }
        if let Some(value) = lookup(ENV_FAILURE_LOG_CAPACITY) {
            config.failure_log_capacity = parse_var(ENV_FAILURE_LOG_CAPACITY, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(AuditError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.page_limit == 0 {
            return Err(AuditError::Config(
                "page_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Clamp a requested page size to `1..=page_limit`
    ///
    /// A zero `page_limit` (unvalidated config) is treated as 1.
    pub fn clamp_page(&self, limit: usize) -> usize {
        limit.max(1).min(self.page_limit.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AuditError::Config(format!("Invalid value for {}: '{}' ({})", key, value, e)))
}
