//! Configuration for the shell core and module runtime.
//!
//! All fields have defaults so an embedder can construct configuration from
//! an external store (JSON) with any subset of keys present. Durations are
//! serialized as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Script execution settings.
    pub script: ScriptConfig,
    /// Module runtime settings.
    pub runtime: RuntimeConfig,
}

impl ShellConfig {
    /// Load configuration from a JSON document (the configuration-store
    /// collaborator hands us raw JSON).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Script execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Wall-clock budget for a whole script run.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Emit per-statement trace logging.
    pub debug: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

/// Module runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Initial size of the host-provided linear memory, in 64 KiB pages.
    pub min_memory_pages: u64,
    /// Hard maximum linear memory size, in 64 KiB pages.
    pub max_memory_pages: u64,
    /// Wall-clock budget for a single exported-function call.
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
    /// Maximum number of compiled modules kept in the LRU cache.
    pub cache_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_memory_pages: 2,
            max_memory_pages: 256, // 16 MiB
            execution_timeout: Duration::from_secs(5),
            cache_size: 16,
        }
    }
}

/// Helper for serializing Duration as milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.runtime.min_memory_pages, 2);
        assert_eq!(config.runtime.max_memory_pages, 256);
        assert_eq!(config.runtime.cache_size, 16);
        assert_eq!(config.script.timeout, Duration::from_secs(30));
        assert!(!config.script.debug);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ShellConfig::from_json(r#"{"runtime": {"cache_size": 4}}"#).unwrap();
        assert_eq!(config.runtime.cache_size, 4);
        // Unspecified keys fall back to defaults.
        assert_eq!(config.runtime.min_memory_pages, 2);
    }

    #[test]
    fn test_timeout_serialized_as_ms() {
        let config = ShellConfig::from_json(r#"{"script": {"timeout": 1500}}"#).unwrap();
        assert_eq!(config.script.timeout, Duration::from_millis(1500));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"timeout\":1500"));
    }
}
