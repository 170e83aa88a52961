//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("configuration file not found: {}", .path.display())]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// Failed to read a configuration file.
    #[error("failed to read configuration file: {}", .path.display())]
    ReadError {
        /// Path to the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML configuration: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A `.env` file could not be loaded.
    #[error("failed to load dotenv file {}: {reason}", .path.display())]
    DotenvError {
        /// Path to the file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field with the invalid value.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// Missing required field.
    #[error("missing required configuration field: {field}")]
    MissingField {
        /// The missing field name.
        field: String,
    },

    /// Environment variable parsing error.
    #[error("failed to parse environment variable {var}: {reason}")]
    EnvParseError {
        /// The environment variable name.
        var: String,
        /// Explanation of the parsing error.
        reason: String,
    },

    /// Validation error after loading.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a read error.
    pub fn read_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    /// Creates a dotenv error.
    pub fn dotenv_error(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DotenvError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an environment variable parse error.
    pub fn env_parse_error(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_not_found_error() {
        let err = ConfigError::file_not_found("/path/to/trellis.toml");
        assert!(err.to_string().contains("/path/to/trellis.toml"));
    }

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigError::invalid_value("connectors[0].host", "empty host");
        assert!(err.to_string().contains("connectors[0].host"));
        assert!(err.to_string().contains("empty host"));
    }

    #[test]
    fn test_missing_field_error() {
        let err = ConfigError::missing_field("connectors[1].tls");
        assert!(err.to_string().contains("connectors[1].tls"));
    }

    #[test]
    fn test_env_parse_error() {
        let err = ConfigError::env_parse_error("TRELLIS__CONNECTORS__0__PORT", "expected integer");
        assert!(err.to_string().contains("TRELLIS__CONNECTORS__0__PORT"));
        assert!(err.to_string().contains("expected integer"));
    }

    #[test]
    fn test_dotenv_error() {
        let err = ConfigError::dotenv_error("/srv/.env", "line 3: bad quote");
        assert!(err.to_string().contains("/srv/.env"));
        assert!(err.to_string().contains("line 3"));
    }
}
