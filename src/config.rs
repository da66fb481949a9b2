//! Per-input configuration options.
//!
//! Input configurations are dynamic JSON values: the manager reads the
//! recognized options below and hands the full value on to the user's
//! configure callback, which is free to define any further fields.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Idle time before an unreferenced cursor entry may be evicted, used when
/// neither the manager nor the input configures one.
pub const DEFAULT_CLEAN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Sweep cadence used when the backing store does not advertise one.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Errors from reading the recognized per-input options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A recognized field had the wrong type or an unparsable duration.
    #[error("invalid input configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Options every stateful input recognizes, next to whatever fields the
/// input type itself defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSettings {
    /// Identifier separating otherwise identical source names in the
    /// persistent store. Empty by default; an empty id leaves the key's id
    /// segment out entirely.
    pub id: String,

    /// Idle time before this input's cursor entries may be evicted.
    pub clean_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    id: String,
    #[serde(with = "humantime_serde")]
    clean_timeout: Option<Duration>,
}

impl InputSettings {
    /// Read the recognized options from an input configuration, filling
    /// omitted fields from `default_clean_timeout`. Unrecognized fields are
    /// left to the configure callback.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a recognized field does not
    /// deserialize.
    pub(crate) fn from_config(
        config: &serde_json::Value,
        default_clean_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let raw = if config.is_null() {
            RawSettings::default()
        } else {
            serde_json::from_value(config.clone())?
        };
        Ok(Self {
            id: raw.id,
            clean_timeout: raw.clean_timeout.unwrap_or(default_clean_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEFAULT: Duration = Duration::from_secs(1800);

    #[test]
    fn test_defaults_apply_when_fields_are_omitted() {
        let settings = InputSettings::from_config(&json!({}), DEFAULT).unwrap();
        assert_eq!(settings.id, "");
        assert_eq!(settings.clean_timeout, DEFAULT);
    }

    #[test]
    fn test_null_config_counts_as_empty() {
        let settings = InputSettings::from_config(&serde_json::Value::Null, DEFAULT).unwrap();
        assert_eq!(settings.id, "");
        assert_eq!(settings.clean_timeout, DEFAULT);
    }

    #[test]
    fn test_explicit_options_override_defaults() {
        let config = json!({"id": "custom", "clean_timeout": "10m"});
        let settings = InputSettings::from_config(&config, DEFAULT).unwrap();
        assert_eq!(settings.id, "custom");
        assert_eq!(settings.clean_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_input_specific_fields_are_ignored() {
        let config = json!({"paths": ["/var/log/a.log"], "id": "x"});
        let settings = InputSettings::from_config(&config, DEFAULT).unwrap();
        assert_eq!(settings.id, "x");
        assert_eq!(settings.clean_timeout, DEFAULT);
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let config = json!({"clean_timeout": "soon"});
        assert!(matches!(
            InputSettings::from_config(&config, DEFAULT),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_wrong_id_type_is_rejected() {
        let config = json!({"id": 7});
        assert!(InputSettings::from_config(&config, DEFAULT).is_err());
    }
}
