//! Configuration management for Massive Tree
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `MT__SECTION__KEY` environment variables.

use crate::core::error::{Error, Result};
use crate::db::DatabaseOptions;
use crate::queue::LockOptions;
use crate::storage::ids::IdConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "massive-tree.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MT";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Orchestrator options
    pub database: DatabaseOptions,

    /// Identifier generation for `add`
    pub ids: IdConfig,

    /// Cross-process file lock tuning
    pub lock: LockOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (compact, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::build(DEFAULT_CONFIG_FILE, false)
    }

    /// Load configuration from a TOML file, with environment overrides applied on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .to_str()
            .ok_or_else(|| Error::config(format!("Config path is not valid UTF-8: {:?}", path)))?;
        Self::build(name, true)
    }

    fn build(file: &str, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).format(config::FileFormat::Toml).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.ids.validate()?;

        if self.lock.max_backoff < self.lock.min_backoff {
            return Err(Error::config("lock.max_backoff must not be below lock.min_backoff"));
        }

        if self.lock.stale.is_zero() {
            return Err(Error::config("lock.stale must be greater than zero"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "compact" | "pretty" => {}
            _ => return Err(Error::config("Invalid log format (expected compact or pretty)")),
        }

        Ok(())
    }
}

/// Serde helpers for durations written as `"250ms"`, `"5s"`, `"2m"`, `"1h"`
/// or a bare number of milliseconds.
pub mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    /// Serialize as a millisecond string
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    /// Deserialize from a duration string or integer milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '30s' or '500ms', or milliseconds")
            }

            fn visit_str<E>(self, value: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse(value).map_err(E::custom)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_millis(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Duration::from_millis)
                    .map_err(|_| E::custom("duration must not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    /// Parse the common duration suffixes
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            let ms: u64 = ms.trim().parse().map_err(|_| format!("Invalid milliseconds: {}", s))?;
            Ok(Duration::from_millis(ms))
        } else if let Some(secs) = s.strip_suffix('s') {
            let secs: u64 = secs.trim().parse().map_err(|_| format!("Invalid seconds: {}", s))?;
            Ok(Duration::from_secs(secs))
        } else if let Some(mins) = s.strip_suffix('m') {
            let mins: u64 = mins.trim().parse().map_err(|_| format!("Invalid minutes: {}", s))?;
            Ok(Duration::from_secs(mins * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            let hours: u64 = hours.trim().parse().map_err(|_| format!("Invalid hours: {}", s))?;
            Ok(Duration::from_secs(hours * 3600))
        } else {
            let ms: u64 = s.parse().map_err(|_| format!("Invalid duration format: {}", s))?;
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.database.write_all);
        assert!(config.database.read_first);
        assert!(config.database.fail_on_primary_error);
        assert!(config.database.lazy_connect);
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(duration::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration::parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(duration::parse("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(duration::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration::parse("40").unwrap(), Duration::from_millis(40));
        assert!(duration::parse("soon").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
write_all = false
write_timeout = 75

[ids]
length = 12

[lock]
stale = "3s"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(!config.database.write_all);
        assert_eq!(config.database.write_timeout, Some(75));
        assert_eq!(config.ids.length, 12);
        assert_eq!(config.lock.stale, Duration::from_secs(3));
        // Untouched sections keep their defaults
        assert!(config.database.read_first);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
