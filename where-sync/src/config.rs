//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::FixedOffset;
use serde::Deserialize;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for read-after-write waits
    pub read_after_write_timeout_ms: u64,
    /// Re-check interval while waiting (covers lagged change events)
    pub read_after_write_poll_ms: u64,
    /// Name of the session materialised for a space with none
    pub default_session_name: String,
    /// UTC offset of the reference timezone for day labels
    pub reference_utc_offset_minutes: i32,
    /// strftime format of the generative session label
    pub session_label_format: String,
    pub default_zoom: f64,
    pub min_zoom: f64,
    /// Inbound signals buffered per peer
    pub signal_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_after_write_timeout_ms: 2000,
            read_after_write_poll_ms: 100,
            default_session_name: "global".to_string(),
            // America/New_York, standard time
            reference_utc_offset_minutes: -5 * 60,
            session_label_format: "%d/%m/%Y".to_string(),
            default_zoom: 1.0,
            min_zoom: 0.1,
            signal_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_after_write_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "read_after_write_poll_ms",
                reason: "must be positive".into(),
            });
        }
        if self.default_session_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_session_name",
                reason: "must not be empty".into(),
            });
        }
        if self.reference_offset().is_none() {
            return Err(ConfigError::Invalid {
                field: "reference_utc_offset_minutes",
                reason: format!("{} is out of range", self.reference_utc_offset_minutes),
            });
        }
        check_label_format(&self.session_label_format)?;
        if self.signal_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "signal_queue_capacity",
                reason: "must be positive".into(),
            });
        }
        if self.min_zoom <= 0.0 || self.default_zoom < self.min_zoom {
            return Err(ConfigError::Invalid {
                field: "min_zoom",
                reason: "must be positive and not above default_zoom".into(),
            });
        }
        Ok(())
    }

    pub fn read_after_write_timeout(&self) -> Duration {
        Duration::from_millis(self.read_after_write_timeout_ms)
    }

    pub fn read_after_write_poll(&self) -> Duration {
        Duration::from_millis(self.read_after_write_poll_ms)
    }

    pub fn reference_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.reference_utc_offset_minutes * 60)
    }
}

/// Reject empty or unparseable strftime formats.
pub(crate) fn check_label_format(format: &str) -> Result<(), ConfigError> {
    if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::Invalid {
            field: "session_label_format",
            reason: format!("'{format}' is not a valid strftime format"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.read_after_write_timeout(), Duration::from_millis(2000));
        assert_eq!(config.read_after_write_poll(), Duration::from_millis(100));
        assert_eq!(config.default_session_name, "global");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            read_after_write_timeout_ms = 500
            default_session_name = "day 0"
            "#,
        )
        .unwrap();
        assert_eq!(config.read_after_write_timeout_ms, 500);
        assert_eq!(config.default_session_name, "day 0");
        assert_eq!(config.read_after_write_poll_ms, 100);
        assert_eq!(config.session_label_format, "%d/%m/%Y");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("read_after_write_poll_ms = 0"),
            Err(ConfigError::Invalid { field: "read_after_write_poll_ms", .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("reference_utc_offset_minutes = 100000"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("session_label_format = \"%Q\""),
            Err(ConfigError::Invalid { field: "session_label_format", .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("default_zoom = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "signal_queue_capacity = 8").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.signal_queue_capacity, 8);

        let missing = EngineConfig::load("/definitely/not/here.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
