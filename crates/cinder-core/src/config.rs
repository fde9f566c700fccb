//! Configuration management for Cinder
//!
//! Handles loading, validation and persistence of the engine configuration.
//! Every section is `#[serde(default)]`, so a partial TOML file only needs to
//! name what it overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CinderError, Result};
use crate::storage::hybridlog::{BackgroundTaskConfig, HybridLogConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage engine configuration
    pub storage: HybridLogConfig,

    /// Background maintenance configuration
    pub background: BackgroundTaskConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Read and parse a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| CinderError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse_str(&contents)
    }

    /// Parse a TOML configuration; sections left out keep their defaults
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CinderError::Config(format!("invalid config: {e}")))
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.background.validate()?;
        self.logging.validate()
    }

    /// Write the configuration as TOML, replacing `path` atomically
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CinderError::Config(format!("cannot encode config: {e}")))?;

        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,

    /// Log file path (None for stdout)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        self.level.parse::<tracing::Level>().map(|_| ()).map_err(|_| {
            CinderError::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error; got {:?}",
                self.level
            ))
        })
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

/// Durability policy for the hot segment's write-through file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every write
    Always,

    /// fsync once per second (accepts "everysecond" or "everysec")
    #[default]
    #[serde(alias = "everysec")]
    EverySecond,

    /// Let OS decide when to sync
    No,
}

/// Duration serialization as whole seconds
pub(crate) mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Duration serialization as milliseconds, for sub-second knobs
pub(crate) mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
