/// Ambient configuration layer (§1a). Mirrors the discovery strategy of a local
/// project file overriding a user-level file overriding an env var, with every
/// sub-section defaulted so a missing file is never fatal.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{OrchestratorError, OrchestratorResult};

const LOCAL_CONFIG_PATH: &str = ".relay/config.toml";
const ENV_CONFIG_VAR: &str = "RELAY_CONFIG";

/// How the active config file was located, kept for diagnostics/logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDiscoveryStrategy {
    /// `.relay/config.toml` under the current directory, or `~/.relay/config.toml`.
    Default,
    /// An explicit path was passed (CLI flag or `ConfigLoader::from_path`).
    Explicit,
    /// No file found anywhere; `RELAY_CONFIG` env var pointed at one instead.
    EnvironmentOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub migration_lock_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: ".relay/state.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            migration_lock_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub watch_paths: Vec<String>,
    pub poll_interval_ms: u64,
    pub restart_backoff_ms: u64,
    pub max_consecutive_restarts: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            watch_paths: vec![".".to_string()],
            poll_interval_ms: 2_000,
            restart_backoff_ms: 500,
            max_consecutive_restarts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub window_ms: u64,
    pub max_pending_per_path: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            window_ms: 300,
            max_pending_per_path: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub unchanged_polls_before_backoff: u64,
    pub max_retry_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            base_interval_ms: 1_000,
            max_interval_ms: 30_000,
            backoff_multiplier: 2.0,
            unchanged_polls_before_backoff: 3,
            max_retry_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stale_heartbeat_secs: u64,
    pub scan_interval_secs: u64,
    pub max_recovery_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            stale_heartbeat_secs: 120,
            scan_interval_secs: 30,
            max_recovery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub required_fields: Vec<String>,
    pub required_sections: Vec<String>,
    pub strict: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            required_fields: vec!["task_id".to_string(), "status".to_string()],
            required_sections: vec!["Summary".to_string()],
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub target: bool,
    pub line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            target: false,
            line_number: true,
        }
    }
}

/// Root configuration document, `.relay/config.toml` (§1a).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub store: StoreConfig,
    pub watcher: WatcherConfig,
    pub debounce: DebounceConfig,
    pub poller: PollerConfig,
    pub recovery: RecoveryConfig,
    pub validator: ValidatorConfig,
    pub logging: LoggingConfig,
}

/// Locates and parses an `OrchestratorConfig`, recording which strategy found it.
pub struct ConfigLoader {
    strategy: ConfigDiscoveryStrategy,
    path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Discover order: explicit path (if given) -> `./.relay/config.toml` ->
    /// `~/.relay/config.toml` -> `RELAY_CONFIG` env var -> built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return ConfigLoader {
                strategy: ConfigDiscoveryStrategy::Explicit,
                path: Some(path.to_path_buf()),
            };
        }

        let local = PathBuf::from(LOCAL_CONFIG_PATH);
        if local.is_file() {
            return ConfigLoader {
                strategy: ConfigDiscoveryStrategy::Default,
                path: Some(local),
            };
        }

        if let Some(home) = dirs::home_dir() {
            let candidate = home.join(".relay").join("config.toml");
            if candidate.is_file() {
                return ConfigLoader {
                    strategy: ConfigDiscoveryStrategy::Default,
                    path: Some(candidate),
                };
            }
        }

        if let Ok(env_path) = std::env::var(ENV_CONFIG_VAR) {
            return ConfigLoader {
                strategy: ConfigDiscoveryStrategy::EnvironmentOnly,
                path: Some(PathBuf::from(env_path)),
            };
        }

        ConfigLoader {
            strategy: ConfigDiscoveryStrategy::Default,
            path: None,
        }
    }

    pub fn strategy(&self) -> ConfigDiscoveryStrategy {
        self.strategy
    }

    pub fn load(&self) -> OrchestratorResult<OrchestratorConfig> {
        let Some(path) = &self.path else {
            return Ok(OrchestratorConfig::default());
        };

        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("reading {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| OrchestratorError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.poller.max_interval_ms > cfg.poller.base_interval_ms);
        assert!(cfg.store.max_connections >= cfg.store.min_connections);
    }

    #[test]
    fn loader_falls_back_to_defaults_when_nothing_found() {
        let loader = ConfigLoader {
            strategy: ConfigDiscoveryStrategy::Default,
            path: None,
        };
        let cfg = loader.load().expect("default load never fails");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn explicit_path_parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\nbase_interval_ms = 500\n").unwrap();
        let loader = ConfigLoader::discover(Some(&path));
        assert_eq!(loader.strategy(), ConfigDiscoveryStrategy::Explicit);
        let cfg = loader.load().unwrap();
        assert_eq!(cfg.poller.base_interval_ms, 500);
        assert_eq!(cfg.store.max_connections, 10);
    }
}
