//! Runtime behavior flags consulted by the session layer.
//!
//! Loading and merging config files is the host application's job; this
//! module only defines the flags and a read-only accessor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a notebook changes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCellChange {
    /// Re-run changed cells.
    Autorun,
    /// Mark changed cells stale without running them.
    #[default]
    Lazy,
}

/// Runtime flags. Every field has a default, so a partial document
/// deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub on_cell_change: OnCellChange,
    /// Run every cell when a notebook is first opened.
    pub auto_instantiate: bool,
    /// Grace window before an orphaned run-mode session is closed.
    pub ttl_seconds: u64,
    pub heartbeat_interval_ms: u64,
    /// Persist the session view to disk (edit mode only).
    pub cache_enabled: bool,
    pub cache_interval_ms: u64,
    /// Allow several primary editors on one notebook.
    pub collaborative: bool,
    /// Time a kernel process gets to exit after stop before it is killed.
    pub kernel_grace_period_ms: u64,
    /// Time a kernel process gets to print its ready token.
    pub handshake_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            on_cell_change: OnCellChange::default(),
            auto_instantiate: true,
            ttl_seconds: 120,
            heartbeat_interval_ms: 1000,
            cache_enabled: true,
            cache_interval_ms: 4000,
            collaborative: false,
            kernel_grace_period_ms: 2000,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cache_interval(&self) -> Duration {
        Duration::from_millis(self.cache_interval_ms)
    }

    pub fn kernel_grace_period(&self) -> Duration {
        Duration::from_millis(self.kernel_grace_period_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Read-only access to the current runtime flags.
///
/// Implementations may reload their source between calls; the session
/// layer reads the config at the point of use and never caches it.
pub trait ConfigManager: Send + Sync {
    fn runtime_config(&self) -> RuntimeConfig;
}

/// A fixed config value.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub RuntimeConfig);

impl ConfigManager for StaticConfig {
    fn runtime_config(&self) -> RuntimeConfig {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"ttl_seconds": 2, "on_cell_change": "autorun"}"#).unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(2));
        assert_eq!(config.on_cell_change, OnCellChange::Autorun);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert!(config.auto_instantiate);
        assert!(!config.collaborative);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_static_config_returns_value() {
        let manager = StaticConfig(RuntimeConfig {
            collaborative: true,
            ..Default::default()
        });
        assert!(manager.runtime_config().collaborative);
    }
}
