//! Layered configuration loading.
//!
//! [`ConfigLoader`] starts from defaults (or a preset), replaces them with a
//! TOML or JSON file, then applies environment overrides.

use std::env;
use std::fs;
use std::path::Path;

use trellis_telemetry::LogFormat;

use crate::schema::{ConnectorSettings, TlsSettings};
use crate::{ConfigError, TrellisConfig};

/// Loads a [`TrellisConfig`] in layers, later layers overriding earlier ones:
///
/// 1. Default values (or a preset)
/// 2. A configuration file (TOML or JSON); fields it omits keep their
///    serde defaults
/// 3. Variables from a `.env` file
/// 4. Environment variables under a prefix
///
/// # Environment overrides
///
/// With prefix `TRELLIS`:
///
/// - `TRELLIS__SERVER__NAME=edge`
/// - `TRELLIS__CONNECTORS__0__PORT=8443`
/// - `TRELLIS__CONNECTORS__0__PROTOCOLS=h2,http/1.1`
/// - `TRELLIS__CONNECTORS__1__TLS__CERT_PATH=/etc/trellis/cert.pem`
/// - `TRELLIS__TELEMETRY__LOGGING__LEVEL=debug`
/// - `TRELLIS__TELEMETRY__METRICS__ENABLED=true`
///
/// A connector index past the end of the list appends connectors named
/// `connector-<index>`.
///
/// # Example
///
/// ```no_run
/// use trellis_config::ConfigLoader;
///
/// # fn main() -> Result<(), trellis_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_defaults()
///     .with_file("trellis.toml")?
///     .with_env_prefix("TRELLIS")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: TrellisConfig,
    env_prefix: Option<String>,
    file_loaded: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader holding the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: TrellisConfig::default(),
            env_prefix: None,
            file_loaded: false,
        }
    }

    /// Resets to the default configuration.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = TrellisConfig::default();
        self
    }

    /// Starts from [`TrellisConfig::development`].
    ///
    /// ```
    /// use trellis_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new().with_development().load().unwrap();
    /// assert_eq!(config.telemetry.logging.level, "debug");
    /// ```
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = TrellisConfig::development();
        self
    }

    /// Starts from [`TrellisConfig::production`].
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = TrellisConfig::production();
        self
    }

    /// Starts from a configuration built in code.
    #[must_use]
    pub fn with_config(mut self, config: TrellisConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads a file. The format follows the extension: `.toml` or `.json`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file does not exist, cannot be read, or
    /// does not parse (unknown fields included).
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        self.config = Self::parse_file(&content, path)?;
        self.file_loaded = true;

        Ok(self)
    }

    /// Like [`with_file`](Self::with_file), but a missing file is skipped.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Loads configuration from a string in `format` (`"toml"` or `"json"`).
    ///
    /// ```
    /// use trellis_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string(r#"{"server": {"name": "edge"}}"#, "json")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.server.name, "edge");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if parsing fails or the format is unknown.
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            _ => {
                return Err(ConfigError::validation_error(format!(
                    "unsupported configuration format: {format}"
                )))
            }
        };
        Ok(self)
    }

    /// Sets the prefix for environment overrides (upper-cased).
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Loads `.env` from the current directory or its parents, if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a `.env` file exists but cannot be parsed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(ConfigError::dotenv_error(".env", e)),
        }
    }

    /// Loads variables from a specific dotenv file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing or malformed.
    pub fn with_dotenv_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        dotenvy::from_path(path).map_err(|e| ConfigError::dotenv_error(path, e))?;
        Ok(self)
    }

    /// Whether a configuration file was loaded.
    #[must_use]
    pub fn file_loaded(&self) -> bool {
        self.file_loaded
    }

    /// Applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override does not parse or the result is
    /// invalid.
    pub fn load(self) -> Result<TrellisConfig, ConfigError> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides without validating.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override does not parse.
    pub fn load_unvalidated(mut self) -> Result<TrellisConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            let mut vars: Vec<(String, String)> = env::vars().collect();
            vars.sort();
            self.apply_env_vars(&prefix, vars)?;
        }
        Ok(self.config)
    }

    fn parse_file(content: &str, path: &Path) -> Result<TrellisConfig, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            Some(ext) => Err(ConfigError::validation_error(format!(
                "unsupported configuration file extension: .{ext}"
            ))),
            None => Err(ConfigError::validation_error(
                "configuration file has no extension; expected .toml or .json",
            )),
        }
    }

    fn apply_env_vars<I>(&mut self, prefix: &str, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let full_prefix = format!("{prefix}__");
        for (key, value) in vars {
            if key.starts_with(&full_prefix) {
                self.apply_env_var(&key, &value, prefix)?;
            }
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(path) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            return Ok(());
        };
        let parts: Vec<&str> = path.split("__").collect();

        match parts.as_slice() {
            ["SERVER", "NAME"] => self.config.server.name = value.to_string(),

            ["CONNECTORS", index, field @ ..] => {
                let index: usize = index.parse().map_err(|_| {
                    ConfigError::env_parse_error(key, format!("'{index}' is not a connector index"))
                })?;
                let connector = self.connector_at(index);
                apply_connector_var(connector, field, key, value)?;
            }

            ["TELEMETRY", "LOGGING", "ENABLED"] => {
                self.config.telemetry.logging.enabled = parse_bool(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "LEVEL"] => {
                self.config.telemetry.logging.level = value.to_string();
            }
            ["TELEMETRY", "LOGGING", "FORMAT"] => {
                self.config.telemetry.logging.format = parse_log_format(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "FILE_LINE_INFO"] => {
                self.config.telemetry.logging.file_line_info = parse_bool(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ENABLED"] => {
                self.config.telemetry.metrics.enabled = parse_bool(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ADDR"] => {
                self.config.telemetry.metrics.addr = value.to_string();
            }

            // Unknown keys are left for other consumers of the prefix.
            _ => {}
        }

        Ok(())
    }

    fn connector_at(&mut self, index: usize) -> &mut ConnectorSettings {
        let connectors = &mut self.config.connectors;
        while connectors.len() <= index {
            let name = format!("connector-{}", connectors.len());
            connectors.push(ConnectorSettings::new(name));
        }
        &mut connectors[index]
    }
}

fn apply_connector_var(
    connector: &mut ConnectorSettings,
    field: &[&str],
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match field {
        ["NAME"] => connector.name = value.to_string(),
        ["HOST"] => connector.host = value.to_string(),
        ["PORT"] => connector.port = parse_number(key, value)?,
        ["BACKLOG"] => connector.backlog = parse_number(key, value)?,
        ["GRACE_PERIOD_MS"] => connector.grace_period_ms = parse_number(key, value)?,
        ["NEGOTIATION_TIMEOUT_MS"] => connector.negotiation_timeout_ms = parse_number(key, value)?,
        ["MAX_CONNECTIONS"] => {
            connector.max_connections = if value.is_empty() || value.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_number(key, value)?)
            };
        }
        ["NEGOTIATOR"] => connector.negotiator = non_empty(value),
        ["PROTOCOLS"] => {
            connector.protocols = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        ["DEFAULT_PROTOCOL"] => connector.default_protocol = non_empty(value),
        ["TLS", "CERT_PATH"] => tls_mut(connector).cert_path = value.into(),
        ["TLS", "KEY_PATH"] => tls_mut(connector).key_path = value.into(),
        _ => {}
    }
    Ok(())
}

fn tls_mut(connector: &mut ConnectorSettings) -> &mut TlsSettings {
    connector.tls.get_or_insert_with(|| TlsSettings {
        cert_path: Default::default(),
        key_path: Default::default(),
    })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, format!("'{value}' is not a valid number")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_parse_error(
            key,
            format!("'{value}' is not a valid boolean"),
        )),
    }
}

fn parse_log_format(key: &str, value: &str) -> Result<LogFormat, ConfigError> {
    match value.to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(ConfigError::env_parse_error(
            key,
            format!("'{value}' is not a log format (json, pretty)"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOML: &str = r#"
        [server]
        name = "edge"

        [[connectors]]
        name = "plain"
        host = "127.0.0.1"
        port = 7000
        protocols = ["echo"]

        [[connectors]]
        name = "secure"
        port = 7443
        negotiator = "alpn"
        protocols = ["h2", "http/1.1"]
        default_protocol = "http/1.1"

        [connectors.tls]
        cert_path = "cert.pem"
        key_path = "key.pem"
    "#;

    fn temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn apply(loader: &mut ConfigLoader, key: &str, value: &str) -> Result<(), ConfigError> {
        loader.apply_env_var(key, value, "TRELLIS")
    }

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config, TrellisConfig::default());
    }

    #[test]
    fn test_load_toml_file() {
        let file = temp_file(".toml", TOML);
        let loader = ConfigLoader::new().with_file(file.path()).unwrap();
        assert!(loader.file_loaded());

        let config = loader.load().unwrap();
        assert_eq!(config.server.name, "edge");
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connector("plain").unwrap().port, 7000);
        let secure = config.connector("secure").unwrap();
        assert!(secure.uses_alpn());
        assert_eq!(secure.default_protocol.as_deref(), Some("http/1.1"));
        assert_eq!(secure.grace_period_ms, 30_000);
    }

    #[test]
    fn test_load_json_file() {
        let json = r#"{
            "connectors": [{ "name": "a", "port": 0, "protocols": ["echo"] }],
            "telemetry": { "logging": { "format": "pretty" } }
        }"#;
        let file = temp_file(".json", json);

        let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(config.connectors[0].port, 0);
        assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::new().with_file("/nonexistent/trellis.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));

        let loader = ConfigLoader::new()
            .with_optional_file("/nonexistent/trellis.toml")
            .unwrap();
        assert!(!loader.file_loaded());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = temp_file(".yaml", "server: {}");
        let result = ConfigLoader::new().with_file(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_file_is_rejected_on_load() {
        let file = temp_file(
            ".toml",
            r#"
            [[connectors]]
            name = "a"
            protocols = []
            "#,
        );
        let result = ConfigLoader::new().with_file(file.path()).unwrap().load();
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn test_with_config_then_env() {
        let mut base = ConnectorSettings::new("echo");
        base.protocols = vec!["echo".into()];
        let mut loader = ConfigLoader::new().with_config(TrellisConfig::builder().connector(base).build());

        apply(&mut loader, "TRELLIS__CONNECTORS__0__PORT", "7100").unwrap();
        let config = loader.load().unwrap();
        assert_eq!(config.connectors[0].name, "echo");
        assert_eq!(config.connectors[0].port, 7100);
    }

    #[test]
    fn test_env_server_name() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "TRELLIS__SERVER__NAME", "from-env").unwrap();
        assert_eq!(loader.config.server.name, "from-env");
    }

    #[test]
    fn test_env_connector_fields() {
        let mut loader = ConfigLoader::new().with_string(TOML, "toml").unwrap();

        apply(&mut loader, "TRELLIS__CONNECTORS__0__PORT", "9000").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__0__HOST", "0.0.0.0").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__0__GRACE_PERIOD_MS", "0").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__0__MAX_CONNECTIONS", "64").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__1__PROTOCOLS", "http/1.1, h2").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__1__TLS__KEY_PATH", "/keys/k.pem").unwrap();

        let plain = &loader.config.connectors[0];
        assert_eq!(plain.port, 9000);
        assert_eq!(plain.host, "0.0.0.0");
        assert_eq!(plain.grace_period_ms, 0);
        assert_eq!(plain.max_connections, Some(64));

        let secure = &loader.config.connectors[1];
        assert_eq!(secure.protocols, ["http/1.1", "h2"]);
        let tls = secure.tls.as_ref().unwrap();
        assert_eq!(tls.cert_path, std::path::PathBuf::from("cert.pem"));
        assert_eq!(tls.key_path, std::path::PathBuf::from("/keys/k.pem"));
    }

    #[test]
    fn test_env_appends_connectors() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "TRELLIS__CONNECTORS__1__PROTOCOLS", "echo").unwrap();

        assert_eq!(loader.config.connectors.len(), 2);
        assert_eq!(loader.config.connectors[0].name, "connector-0");
        assert_eq!(loader.config.connectors[1].name, "connector-1");
        assert_eq!(loader.config.connectors[1].protocols, ["echo"]);
    }

    #[test]
    fn test_env_clears_optional_fields() {
        let mut loader = ConfigLoader::new().with_string(TOML, "toml").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__1__DEFAULT_PROTOCOL", "").unwrap();
        apply(&mut loader, "TRELLIS__CONNECTORS__0__MAX_CONNECTIONS", "none").unwrap();

        assert!(loader.config.connectors[1].default_protocol.is_none());
        assert!(loader.config.connectors[0].max_connections.is_none());
    }

    #[test]
    fn test_env_telemetry() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "TRELLIS__TELEMETRY__LOGGING__LEVEL", "trace").unwrap();
        apply(&mut loader, "TRELLIS__TELEMETRY__LOGGING__FORMAT", "Pretty").unwrap();
        apply(&mut loader, "TRELLIS__TELEMETRY__METRICS__ENABLED", "yes").unwrap();
        apply(&mut loader, "TRELLIS__TELEMETRY__METRICS__ADDR", "127.0.0.1:9100").unwrap();

        let telemetry = &loader.config.telemetry;
        assert_eq!(telemetry.logging.level, "trace");
        assert_eq!(telemetry.logging.format, LogFormat::Pretty);
        assert!(telemetry.metrics.enabled);
        assert_eq!(telemetry.metrics.addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_env_parse_errors() {
        let mut loader = ConfigLoader::new();

        let err = apply(&mut loader, "TRELLIS__CONNECTORS__0__PORT", "eighty").unwrap_err();
        assert!(matches!(err, ConfigError::EnvParseError { .. }));

        let err = apply(&mut loader, "TRELLIS__CONNECTORS__first__PORT", "80").unwrap_err();
        assert!(err.to_string().contains("connector index"));

        let err = apply(&mut loader, "TRELLIS__TELEMETRY__METRICS__ENABLED", "maybe").unwrap_err();
        assert!(err.to_string().contains("boolean"));

        let err = apply(&mut loader, "TRELLIS__TELEMETRY__LOGGING__FORMAT", "xml").unwrap_err();
        assert!(err.to_string().contains("log format"));
    }

    #[test]
    fn test_env_ignores_other_prefixes() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env_vars(
                "TRELLIS",
                vec![
                    ("OTHER__SERVER__NAME".to_string(), "nope".to_string()),
                    ("TRELLIS__SERVER__NAME".to_string(), "yes".to_string()),
                    ("TRELLIS__UNKNOWN__KEY".to_string(), "ignored".to_string()),
                ],
            )
            .unwrap();
        assert_eq!(loader.config.server.name, "yes");
    }

    #[test]
    fn test_dotenv_file() {
        let file = temp_file(".env", "TRELLIS_DOTENV_TEST_MARKER=loaded\n");
        ConfigLoader::new().with_dotenv_file(file.path()).unwrap();
        assert_eq!(
            std::env::var("TRELLIS_DOTENV_TEST_MARKER").as_deref(),
            Ok("loaded")
        );

        let result = ConfigLoader::new().with_dotenv_file("/nonexistent/.env");
        assert!(matches!(result, Err(ConfigError::DotenvError { .. })));
    }

    #[test]
    fn test_parse_bool() {
        for value in ["true", "1", "YES", "on"] {
            assert!(parse_bool("K", value).unwrap());
        }
        for value in ["false", "0", "no", "OFF"] {
            assert!(!parse_bool("K", value).unwrap());
        }
    }
}
