//! Engine configuration.
//!
//! [`EngineConfig`] carries the tunables a session injects into the engine:
//! the default idle timeout for freshly created containers, the interactive
//! prompt deadline, and the directory holding system-domain unlock key
//! files. Values load from TOML and every field has a sensible default, so
//! an empty config file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Session-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Idle timeout applied to containers whose persisted parameters have
    /// not been captured yet, in seconds. `0` disables idle locking.
    #[serde(default = "defaults::idle_timeout_secs")]
    pub default_idle_timeout_secs: u64,

    /// How long an interactive prompt may remain unanswered before the
    /// request is abandoned, in seconds.
    #[serde(default = "defaults::prompt_deadline_secs")]
    pub prompt_deadline_secs: u64,

    /// How many times a failed unlock prompt is re-asked before giving up.
    #[serde(default = "defaults::prompt_retry_limit")]
    pub prompt_retry_limit: u32,

    /// Directory holding system-domain unlock key files, one per container
    /// signature.
    #[serde(default = "defaults::system_key_dir")]
    pub system_key_dir: PathBuf,

    /// Name of the session's default system container. That container is
    /// exempt from sleep-triggered locking.
    #[serde(default = "defaults::default_system_container")]
    pub default_system_container: String,
}

mod defaults {
    use std::path::PathBuf;

    pub(super) fn idle_timeout_secs() -> u64 {
        300
    }

    pub(super) fn prompt_deadline_secs() -> u64 {
        300
    }

    pub(super) fn prompt_retry_limit() -> u32 {
        3
    }

    pub(super) fn system_key_dir() -> PathBuf {
        PathBuf::from("/var/lib/coffer/system-keys")
    }

    pub(super) fn default_system_container() -> String {
        "System".into()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_secs: defaults::idle_timeout_secs(),
            prompt_deadline_secs: defaults::prompt_deadline_secs(),
            prompt_retry_limit: defaults::prompt_retry_limit(),
            system_key_dir: defaults::system_key_dir(),
            default_system_container: defaults::default_system_container(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Default idle timeout as a [`Duration`].
    pub fn default_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_secs)
    }

    /// Prompt deadline as a [`Duration`].
    pub fn prompt_deadline(&self) -> Duration {
        Duration::from_secs(self.prompt_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.default_idle_timeout_secs, 300);
        assert_eq!(config.prompt_deadline_secs, 300);
        assert_eq!(config.prompt_retry_limit, 3);
        assert_eq!(config.default_system_container, "System");
    }

    #[test]
    fn partial_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            default_idle_timeout_secs = 60
            system_key_dir = "/tmp/coffer-keys"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_idle_timeout_secs, 60);
        assert_eq!(config.system_key_dir, PathBuf::from("/tmp/coffer-keys"));
        // Untouched fields keep their defaults.
        assert_eq!(config.prompt_retry_limit, 3);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(EngineConfig::from_toml_str("default_idle_timeout_secs = \"soon\"").is_err());
    }
}
