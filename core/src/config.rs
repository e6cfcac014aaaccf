//! Engine configuration.
//!
//! Durations are stored as milliseconds so the whole configuration can be
//! loaded from JSON; accessors hand out [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::TextEncoding;
use crate::error::CallError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long an unreferenced client may sit idle before eviction.
    pub idle_timeout_ms: u64,
    /// Minimum time between access-triggered sweeps.
    pub sweep_interval_ms: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 90_000,
            sweep_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub user_agent: String,
    /// Applied to requests that set no timeout of their own.
    pub default_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// Charset label used when neither the request nor the response names one.
    pub default_encoding: String,
    pub pool: PoolConfig,
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, CallError> {
        serde_json::from_str(raw).map_err(|e| CallError::InvalidRequest(format!("engine config: {e}")))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// The configured default encoding; unknown labels fall back to UTF-8.
    pub fn default_encoding(&self) -> TextEncoding {
        TextEncoding::from_label(&self.default_encoding).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout_ms: None,
            connect_timeout_ms: Some(10_000),
            default_encoding: TextEncoding::Utf8.label().to_string(),
            pool: PoolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert!(config.user_agent.starts_with("courier/"));
        assert_eq!(config.default_timeout(), None);
        assert_eq!(config.default_encoding(), TextEncoding::Utf8);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{"default_timeout_ms": 2500, "default_encoding": "latin1", "pool": {"idle_timeout_ms": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.default_encoding(), TextEncoding::Latin1);
        assert_eq!(config.pool.idle_timeout_ms, 10);
        assert_eq!(config.pool.sweep_interval_ms, 30_000);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = EngineConfig::from_json("{").unwrap_err();
        assert!(matches!(err, CallError::InvalidRequest(_)));
    }

    #[test]
    fn unknown_encoding_label_falls_back_to_utf8() {
        let config = EngineConfig {
            default_encoding: "klingon".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(config.default_encoding(), TextEncoding::Utf8);
    }
}
