use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Idle timeout used when neither the arguments nor the device say otherwise.
pub const DEFAULT_TIMEOUT_SECS: u32 = 5;

/// Upper bound on live idle timers.
pub const DEFAULT_TIMER_CAPACITY: usize = 1024;

const VALID_MODULE_ARGS: &[&str] = &["timeout"];

/// Error types for configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid argument string: {reason}")]
    InvalidFormat { reason: String },

    #[error("Unknown argument: {key}")]
    UnknownArgument { key: String },

    #[error("Argument given more than once: {key}")]
    DuplicateArgument { key: String },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parsed `key=value` argument string, as handed to a server module on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleArgs {
    values: HashMap<String, String>,
}

impl ModuleArgs {
    /// Parse a whitespace separated list of `key=value` pairs.
    ///
    /// Values may be wrapped in single or double quotes, and a backslash
    /// escapes the next character. Keys outside `valid_keys` are rejected.
    pub fn parse(input: &str, valid_keys: &[&str]) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        let mut chars = input.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                key.push(c);
            }
            if chars.next() != Some('=') || key.is_empty() {
                return Err(ConfigError::InvalidFormat {
                    reason: format!("expected key=value near {:?}", key),
                });
            }

            let quote = chars.next_if(|c| *c == '"' || *c == '\'');
            let mut value = String::new();
            let mut closed = quote.is_none();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => {
                            return Err(ConfigError::InvalidFormat {
                                reason: format!("dangling escape in value of {}", key),
                            })
                        }
                    },
                    c if Some(c) == quote => {
                        closed = true;
                        break;
                    }
                    c if quote.is_none() && c.is_whitespace() => break,
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(ConfigError::InvalidFormat {
                    reason: format!("unterminated quote in value of {}", key),
                });
            }

            if !valid_keys.contains(&key.as_str()) {
                return Err(ConfigError::UnknownArgument { key });
            }
            if values.contains_key(&key) {
                return Err(ConfigError::DuplicateArgument { key });
            }
            values.insert(key, value);
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Read `key` as an unsigned integer, falling back to `default` when absent.
    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

/// Settings for the idle suspend engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuspendConfig {
    /// Seconds of inactivity before a device is suspended.
    pub timeout_secs: u32,
    /// Whether devices carrying a reservation name are watched for external locks.
    pub reservation: bool,
    /// Maximum number of idle timers alive at once.
    pub timer_capacity: usize,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            reservation: true,
            timer_capacity: DEFAULT_TIMER_CAPACITY,
        }
    }
}

impl SuspendConfig {
    /// Build a configuration from a module argument string such as `timeout=5`.
    pub fn from_module_args(args: &str) -> Result<Self, ConfigError> {
        let parsed = ModuleArgs::parse(args, VALID_MODULE_ARGS)?;
        let timeout_secs = parsed.get_u32("timeout", DEFAULT_TIMEOUT_SECS)?;
        Ok(Self {
            timeout_secs,
            ..Self::default()
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("suspend-rs")
            .join("config.toml")
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_module_args_timeout() {
        let config = assert_ok!(SuspendConfig::from_module_args("timeout=12"));
        assert_eq!(config.timeout_secs, 12);
        assert_eq!(config.global_timeout(), Duration::from_secs(12));
        assert!(config.reservation);
    }

    #[test]
    fn test_module_args_default_timeout() {
        let config = assert_ok!(SuspendConfig::from_module_args("   "));
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_module_args_quoting() {
        let args = assert_ok!(ModuleArgs::parse(
            "timeout='7' name=\"a b\\\"c\"",
            &["timeout", "name"]
        ));
        assert_eq!(args.get("timeout"), Some("7"));
        assert_eq!(args.get("name"), Some("a b\"c"));
    }

    #[test]
    fn test_module_args_rejects_bad_input() {
        assert!(matches!(
            SuspendConfig::from_module_args("volume=3"),
            Err(ConfigError::UnknownArgument { .. })
        ));
        assert!(matches!(
            SuspendConfig::from_module_args("timeout=1 timeout=2"),
            Err(ConfigError::DuplicateArgument { .. })
        ));
        assert!(matches!(
            SuspendConfig::from_module_args("timeout=-1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            SuspendConfig::from_module_args("timeout"),
            Err(ConfigError::InvalidFormat { .. })
        ));
        assert_err!(SuspendConfig::from_module_args("timeout=\"5"));
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "timeout_secs = 30\nreservation = false\n").unwrap();

        let config = SuspendConfig::load(&config_path).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.reservation);
        assert_eq!(config.timer_capacity, DEFAULT_TIMER_CAPACITY);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = SuspendConfig::load(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SuspendConfig::default());
    }
}
