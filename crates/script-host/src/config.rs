//! Host Configuration
//!
//! Layered with figment: compiled defaults, then a TOML file, then
//! `SCRIPT_HOST_*` environment variables (`__` separates nesting, e.g.
//! `SCRIPT_HOST_REGISTRY__DRAIN_TIMEOUT_MS=1000`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use script_dispatch::{DEFAULT_QUEUE_CAPACITY, DrainPolicy, RegistryConfig};
use script_runtime::RuntimeConfig;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "script-host.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SCRIPT_HOST_";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub runtime: RuntimeConfig,
    pub registry: RegistrySection,
    pub logging: LoggingSection,

    /// Executors registered at startup.
    pub executors: Vec<ExecutorSpec>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default().with_module_search_path("python"),
            registry: RegistrySection::default(),
            logging: LoggingSection::default(),
            executors: Vec::new(),
        }
    }
}

/// What `unregister` does with a busy pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    #[default]
    Wait,
    WaitForever,
    CancelPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub drain_policy: DrainMode,

    /// Grace period for `wait` and `cancel_pending`.
    pub drain_timeout_ms: u64,

    /// Queue bound for pools; 0 for unbounded.
    pub queue_capacity: usize,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            drain_policy: DrainMode::Wait,
            drain_timeout_ms: 5_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RegistrySection {
    pub fn to_registry_config(&self) -> RegistryConfig {
        let grace = Duration::from_millis(self.drain_timeout_ms);
        let policy = match self.drain_policy {
            DrainMode::Wait => DrainPolicy::Wait(grace),
            DrainMode::WaitForever => DrainPolicy::WaitForever,
            DrainMode::CancelPending => DrainPolicy::CancelPending(grace),
        };
        RegistryConfig::default()
            .with_drain_policy(policy)
            .with_queue_capacity(self.queue_capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "script_host=info,script_runtime=info,script_dispatch=info".to_string(),
            json: false,
        }
    }
}

/// An executor to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub module: String,

    /// Class to instantiate; empty for module-level calls.
    #[serde(default)]
    pub class: String,

    #[serde(default)]
    pub pool: bool,

    /// Worker count for pools; 0 for hardware parallelism.
    #[serde(default)]
    pub threads: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration. An explicit `path` must exist; without one,
    /// [`DEFAULT_CONFIG_FILE`] is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: HostConfig = Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = Figment::from(Serialized::defaults(HostConfig::default()))
            .merge(Toml::string(content))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.executors {
            if spec.module.is_empty() {
                return Err(ConfigError::Invalid("executor with empty module name".to_string()));
            }
            if !seen.insert((spec.module.as_str(), spec.class.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "executor {}::{} listed twice",
                    spec.module, spec.class
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.runtime.module_search_path, "python");
        assert_eq!(
            config.registry.to_registry_config().drain_policy,
            DrainPolicy::Wait(Duration::from_secs(5))
        );
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[runtime]
module_search_path = "scripts"
package_path = "site-packages"

[registry]
drain_policy = "cancel_pending"
drain_timeout_ms = 250
queue_capacity = 16

[[executors]]
module = "Core"
class = "Client"
pool = true
threads = 2

[[executors]]
module = "example"
"#
        )
        .unwrap();

        let config = HostConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.runtime.package_path, "site-packages");
        assert_eq!(config.executors.len(), 2);
        assert_eq!(config.executors[1].class, "");
        assert!(!config.executors[1].pool);

        let registry = config.registry.to_registry_config();
        assert_eq!(registry.drain_policy, DrainPolicy::CancelPending(Duration::from_millis(250)));
        assert_eq!(registry.queue_capacity, 16);
        // Untouched sections keep their defaults.
        assert_eq!(config.logging, LoggingSection::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(HostConfig::load(Some(&missing)), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn duplicate_executors_are_rejected() {
        let err = HostConfig::from_toml_str(
            r#"
[[executors]]
module = "Core"
class = "Client"

[[executors]]
module = "Core"
class = "Client"
pool = true
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = HostConfig::default();
        config.executors.push(ExecutorSpec {
            module: "Core".into(),
            class: "Client".into(),
            pool: true,
            threads: 2,
        });
        let text = config.to_toml().unwrap();
        assert_eq!(HostConfig::from_toml_str(&text).unwrap(), config);
    }
}
