//! Router policy configuration.
//!
//! Every knob has a default matching the long-standing broker behaviour, so
//! an empty file (or [`RouterConfig::default`]) yields the stock policy.
//!
//! ```toml
//! max_prepared_sessions = 128
//! min_session_key_size = 64
//! max_session_key_size = 16384
//! legacy_size_retry_limit = 6
//! legacy_other_retry_limit = 1
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::{HOST_FEATURE0_NOTIFY_RDWR_OFFSET, HOST_FEATURE0_PROCESS_ARGV0, MAX_SESSION_ID};

/// Router policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Maximum number of prepared sessions awaiting acceptance.
    #[serde(default = "default_max_prepared_sessions")]
    pub max_prepared_sessions: usize,

    /// Smallest accepted session key, in bytes.
    #[serde(default = "default_min_session_key_size")]
    pub min_session_key_size: usize,

    /// Largest accepted session key, in bytes.
    #[serde(default = "default_max_session_key_size")]
    pub max_session_key_size: usize,

    /// Highest session id a prepare or accept may name.
    #[serde(default = "default_max_session_id")]
    pub max_session_id: u32,

    /// Legacy wait attempts before dropping a message whose delivery keeps
    /// failing for lack of space or because the guest cancelled.
    ///
    /// Old guests peek before every get, so each attempt costs two calls and
    /// the limit must be even.
    #[serde(default = "default_legacy_size_retry_limit")]
    pub legacy_size_retry_limit: u32,

    /// Legacy wait retries for any other delivery failure.
    #[serde(default = "default_legacy_other_retry_limit")]
    pub legacy_other_retry_limit: u32,

    /// Host feature word 0 returned by the feature calls.
    #[serde(default = "default_host_features0")]
    pub host_features0: u64,
}

const fn default_max_prepared_sessions() -> usize {
    128
}

const fn default_min_session_key_size() -> usize {
    64
}

const fn default_max_session_key_size() -> usize {
    16 * 1024
}

const fn default_max_session_id() -> u32 {
    MAX_SESSION_ID
}

const fn default_legacy_size_retry_limit() -> u32 {
    6
}

const fn default_legacy_other_retry_limit() -> u32 {
    1
}

const fn default_host_features0() -> u64 {
    HOST_FEATURE0_NOTIFY_RDWR_OFFSET | HOST_FEATURE0_PROCESS_ARGV0
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_prepared_sessions: default_max_prepared_sessions(),
            min_session_key_size: default_min_session_key_size(),
            max_session_key_size: default_max_session_key_size(),
            max_session_id: default_max_session_id(),
            legacy_size_retry_limit: default_legacy_size_retry_limit(),
            legacy_other_retry_limit: default_legacy_other_retry_limit(),
            host_features0: default_host_features0(),
        }
    }
}

impl RouterConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, names an unknown key, or
    /// fails [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_session_key_size == 0 {
            return Err(ConfigError::Validation(
                "min_session_key_size must be at least 1".to_string(),
            ));
        }
        if self.min_session_key_size > self.max_session_key_size {
            return Err(ConfigError::Validation(format!(
                "min_session_key_size {} exceeds max_session_key_size {}",
                self.min_session_key_size, self.max_session_key_size
            )));
        }
        if self.max_session_id == 0 || self.max_session_id > MAX_SESSION_ID {
            return Err(ConfigError::Validation(format!(
                "max_session_id must be in 1..={MAX_SESSION_ID:#x}"
            )));
        }
        if self.legacy_size_retry_limit == 0 || self.legacy_size_retry_limit % 2 != 0 {
            return Err(ConfigError::Validation(
                "legacy_size_retry_limit must be a non-zero even number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RouterConfig::from_toml("").unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.max_prepared_sessions, 128);
        assert_eq!(config.legacy_size_retry_limit, 6);
        assert_eq!(config.host_features0, 0b11);
    }

    #[test]
    fn overrides_apply() {
        let config = RouterConfig::from_toml(
            "max_prepared_sessions = 4\nlegacy_size_retry_limit = 2\n",
        )
        .unwrap();
        assert_eq!(config.max_prepared_sessions, 4);
        assert_eq!(config.legacy_size_retry_limit, 2);
        assert_eq!(config.min_session_key_size, 64);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RouterConfig::from_toml("max_sessions = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn odd_retry_limit_is_rejected() {
        let err = RouterConfig::from_toml("legacy_size_retry_limit = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn inverted_key_bounds_are_rejected() {
        let err = RouterConfig::from_toml("min_session_key_size = 100\nmax_session_key_size = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = RouterConfig {
            max_prepared_sessions: 9,
            ..RouterConfig::default()
        };
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();
        let loaded = RouterConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
