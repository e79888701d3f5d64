//! Configuration Loader
//!
//! Layers the bridge configuration from three sources, later ones winning:
//! built-in defaults, a TOML file, and `BRIDGE__SECTION__KEY` environment
//! variables. The merged result is validated before it is handed out.

use super::error::{ConfigResult, ConfigurationError};
use super::BridgeConfig;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "BRIDGE_CONFIG_PATH";

/// Environment variable selecting the runtime environment
pub const ENVIRONMENT_ENV: &str = "BRIDGE_ENV";

/// File consulted when no explicit path is given (optional)
pub const DEFAULT_CONFIG_FILE: &str = "config/bridge.toml";

const ENV_PREFIX: &str = "BRIDGE";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: BridgeConfig,
    environment: String,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    ///
    /// Uses `BRIDGE_CONFIG_PATH` when set (the file must then exist),
    /// otherwise `config/bridge.toml` if present.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load_from_path(path),
            _ => Self::load_from_sources(Some(Path::new(DEFAULT_CONFIG_FILE)), false, None),
        }
    }

    /// Load configuration from an explicit TOML file
    pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_sources(Some(path.as_ref()), true, None)
    }

    /// Load configuration with an injected environment map instead of the
    /// process environment. Keys use the `BRIDGE__SECTION__KEY` form.
    pub fn load_with_overrides(
        path: Option<&Path>,
        overrides: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_sources(path, path.is_some(), Some(overrides))
    }

    /// Wrap an already-built configuration, validating it
    pub fn from_config(config: BridgeConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            source_path: None,
        }))
    }

    fn load_from_sources(
        path: Option<&Path>,
        required: bool,
        env_source: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();

        let mut source_path = None;
        let mut builder = Config::builder();

        if let Some(path) = path {
            if path.is_file() {
                debug!(path = %path.display(), "Loading bridge configuration file");
                builder =
                    builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
                source_path = Some(path.to_path_buf());
            } else if required {
                return Err(ConfigurationError::ConfigFileNotFound {
                    path: path.to_path_buf(),
                });
            } else {
                debug!(path = %path.display(), "No configuration file, using defaults");
            }
        }

        builder = builder.add_source(Self::environment_source(env_source));

        let source_name = source_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults and environment".to_string());

        let config: BridgeConfig = builder
            .build()
            .and_then(|merged| merged.try_deserialize())
            .map_err(|e| ConfigurationError::LoadFailed {
                source_name: source_name.clone(),
                error: e.to_string(),
            })?;

        config.validate()?;

        info!(
            environment = %environment,
            source = %source_name,
            primary_port = config.server.primary_port,
            backup_ports = ?config.server.backup_ports,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            source_path,
        }))
    }

    fn environment_source(source: Option<HashMap<String, String>>) -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("server.backup_ports")
            .source(source)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Runtime environment (`BRIDGE_ENV`, default "development")
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was read from, if any
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn detect_environment() -> String {
        env::var(ENVIRONMENT_ENV)
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file_merges_with_defaults() {
        let file = toml_file(
            r#"
[server]
primary_port = 7200
backup_ports = [7201, 7202]

[circuit_breaker]
failure_threshold = 5
timeout_seconds = 1.5
"#,
        );

        let manager = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new())
            .unwrap();
        let config = manager.config();

        assert_eq!(config.server.primary_port, 7200);
        assert_eq!(config.server.backup_ports, vec![7201, 7202]);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.timeout_seconds, 1.5);
        // Untouched values keep their defaults
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.rate_limiter.bucket_size, 200.0);
        assert_eq!(manager.source_path(), Some(file.path()));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = toml_file("[server]\nprimary_port = 7300\n");

        let overrides = HashMap::from([
            ("BRIDGE__SERVER__PRIMARY_PORT".to_string(), "7400".to_string()),
            (
                "BRIDGE__SERVER__BACKUP_PORTS".to_string(),
                "7401,7402".to_string(),
            ),
            (
                "BRIDGE__RATE_LIMITER__CLIENT_BUCKET_SIZE".to_string(),
                "5".to_string(),
            ),
        ]);

        let manager = ConfigManager::load_with_overrides(Some(file.path()), overrides).unwrap();
        let config = manager.config();

        assert_eq!(config.server.primary_port, 7400);
        assert_eq!(config.server.backup_ports, vec![7401, 7402]);
        assert_eq!(config.rate_limiter.client_bucket_size, 5.0);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = ConfigManager::load_from_path("/nonexistent/bridge.toml").unwrap_err();
        assert!(matches!(err, ConfigurationError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let file = toml_file("[backpressure]\nqueue_high = 10\nqueue_elevated = 20\n");
        let err = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_malformed_file_reports_load_failure() {
        let file = toml_file("[server\nprimary_port = ");
        let err = ConfigManager::load_with_overrides(Some(file.path()), HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::LoadFailed { .. }));
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = BridgeConfig::default();
        config.server.max_connections = 0;
        assert!(ConfigManager::from_config(config).is_err());
        assert!(ConfigManager::from_config(BridgeConfig::default()).is_ok());
    }
}
