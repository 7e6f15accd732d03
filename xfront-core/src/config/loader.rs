//! # Configuration Loading
//!
//! Layers configuration from defaults, a TOML file and `XFRONT_*` environment
//! variables, then validates the result.
//!
//! Environment keys use a double underscore between section and field:
//! `XFRONT_LIMITS__MAX_CONNECTIONS=500` overrides `limits.max_connections`.

use crate::{
    config::{schema::FrontendConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Environment variable naming the local socket path when none is configured.
pub const UNIX_SOCKET_ENV: &str = "XFRONT_UNIX_PORT";

/// Local socket path used when neither the file nor the environment names one.
pub const DEFAULT_UNIX_SOCKET: &str = "/tmp/xfront.sock";

const CONFIG_FILE_NAMES: [&str; 2] = ["xfront.toml", "config.toml"];

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env_prefix: String,
    explicit_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("xfront"));
        }
        Self { search_paths, env_prefix: "XFRONT".to_string(), explicit_file: None }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Use this file instead of searching
    #[must_use]
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from all available sources
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when a file cannot be parsed, an
    /// override has the wrong type, or validation fails.
    pub fn load(&self) -> Result<FrontendConfig> {
        self.load_with_env(env::vars())
    }

    /// Same as [`ConfigLoader::load`] with an explicit environment.
    ///
    /// # Errors
    /// See [`ConfigLoader::load`].
    pub fn load_with_env<I>(&self, vars: I) -> Result<FrontendConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        info!("Loading configuration from multiple sources");

        let mut config_value = toml::Value::try_from(FrontendConfig::default()).map_err(|e| {
            Error::configuration(format!("Failed to serialize default config: {e}"))
        })?;

        if let Some(config_path) = self.find_config_file() {
            let file_config = Self::load_config_file(&config_path)?;
            config_value = Self::merge_config(config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        let vars: Vec<(String, String)> = vars.into_iter().collect();
        config_value = self.apply_env_vars(config_value, &vars);

        let mut config: FrontendConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;

        if config.network.socket.is_none() {
            let from_env =
                vars.iter().find(|(key, _)| key == UNIX_SOCKET_ENV).map(|(_, value)| value.clone());
            config.network.socket =
                Some(PathBuf::from(from_env.unwrap_or_else(|| DEFAULT_UNIX_SOCKET.to_string())));
        }

        ConfigValidator::validate(&config)?;

        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when the file is unreadable or invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<FrontendConfig> {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());

        let value = Self::load_config_file(path)?;
        let config = Self::merge_config(
            toml::Value::try_from(FrontendConfig::default()).map_err(|e| {
                Error::configuration(format!("Failed to serialize default config: {e}"))
            })?,
            value,
        );
        let config: FrontendConfig = config
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to parse config file: {e}")))?;

        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when serialization or the write fails.
    pub fn save_to_file<P: AsRef<Path>>(config: &FrontendConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| Error::configuration(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), toml_string).map_err(|e| {
            Error::configuration(format!(
                "Failed to write config to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }

    /// Get the effective search paths being used
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Get the environment prefix being used
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(file) = &self.explicit_file {
            return Some(file.clone());
        }

        for search_path in &self.search_paths {
            for config_name in &CONFIG_FILE_NAMES {
                let config_path = search_path.join(config_name);
                if config_path.exists() {
                    debug!("Found config file: {}", config_path.display());
                    return Some(config_path);
                }
            }
        }

        None
    }

    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Merge two TOML values; tables merge recursively, anything else is replaced
    fn merge_config(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
            (&mut base, override_value)
        {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing_value) if existing_value.is_table() && value.is_table() => {
                        *existing_value = Self::merge_config(existing_value.clone(), value);
                    },
                    Some(existing_value) => {
                        *existing_value = value;
                    },
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        }

        base
    }

    fn apply_env_vars(&self, mut config: toml::Value, vars: &[(String, String)]) -> toml::Value {
        let prefix = format!("{}_", self.env_prefix);
        let mut applied = 0usize;

        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !stripped.contains("__") {
                continue;
            }
            let path = stripped.to_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            Self::set_nested_value(&mut config, &parts, value);
            applied += 1;
        }

        debug!("Applied {} environment overrides", applied);
        config
    }

    fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
        let Some((first, rest)) = parts.split_first() else {
            return;
        };

        if let toml::Value::Table(table) = config {
            if rest.is_empty() {
                table.insert((*first).to_string(), Self::parse_env_value(value));
                return;
            }

            let entry = table
                .entry((*first).to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            Self::set_nested_value(entry, rest, value);
        }
    }

    /// Parse environment variable value to appropriate TOML type
    fn parse_env_value(value: &str) -> toml::Value {
        if let Ok(bool_val) = value.parse::<bool>() {
            return toml::Value::Boolean(bool_val);
        }

        if let Ok(int_val) = value.parse::<i64>() {
            return toml::Value::Integer(int_val);
        }

        if let Ok(float_val) = value.parse::<f64>() {
            return toml::Value::Float(float_val);
        }

        toml::Value::String(value.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn isolated_loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader { search_paths: vec![dir.path().to_path_buf()], ..ConfigLoader::new() }
    }

    #[test]
    fn test_config_loader_creation() {
        let loader = ConfigLoader::new();
        assert!(!loader.search_paths().is_empty());
        assert_eq!(loader.env_prefix(), "XFRONT");
    }

    #[test]
    fn test_defaults_with_socket_fallback() {
        let dir = TempDir::new().unwrap();
        let config = isolated_loader(&dir).load_with_env(Vec::new()).unwrap();

        assert_eq!(config.limits, FrontendConfig::default().limits);
        assert_eq!(config.network.socket, Some(PathBuf::from(DEFAULT_UNIX_SOCKET)));
    }

    #[test]
    fn test_socket_from_environment() {
        let dir = TempDir::new().unwrap();
        let vars = vec![(UNIX_SOCKET_ENV.to_string(), "/run/xfront/x.sock".to_string())];
        let config = isolated_loader(&dir).load_with_env(vars).unwrap();

        assert_eq!(config.network.socket, Some(PathBuf::from("/run/xfront/x.sock")));
    }

    #[test]
    fn test_file_then_env_layering() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("xfront.toml"),
            "[limits]\nmax_connections = 10\nmin_worker_threads = 3\n",
        )
        .unwrap();

        let vars = vec![
            ("XFRONT_LIMITS__MAX_CONNECTIONS".to_string(), "25".to_string()),
            ("OTHER_LIMITS__MAX_CONNECTIONS".to_string(), "99".to_string()),
        ];
        let config = isolated_loader(&dir).load_with_env(vars).unwrap();

        assert_eq!(config.limits.max_connections, 25);
        assert_eq!(config.limits.min_worker_threads, 3);
    }

    #[test]
    fn test_invalid_override_type() {
        let dir = TempDir::new().unwrap();
        let vars = vec![("XFRONT_LIMITS__MAX_CONNECTIONS".to_string(), "many".to_string())];
        let result = isolated_loader(&dir).load_with_env(vars);
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_merge_config() {
        let base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3\n[b]\nz = 4\n").unwrap();

        let merged = ConfigLoader::merge_config(base, overlay);
        assert_eq!(merged["a"]["x"].as_integer(), Some(1));
        assert_eq!(merged["a"]["y"].as_integer(), Some(3));
        assert_eq!(merged["b"]["z"].as_integer(), Some(4));
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(ConfigLoader::parse_env_value("true"), toml::Value::Boolean(true));
        assert_eq!(ConfigLoader::parse_env_value("42"), toml::Value::Integer(42));
        assert_eq!(ConfigLoader::parse_env_value("2.5"), toml::Value::Float(2.5));
        assert_eq!(
            ConfigLoader::parse_env_value("hello"),
            toml::Value::String("hello".to_string())
        );
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = FrontendConfig::default();
        config.limits.max_connections = 42;
        ConfigLoader::save_to_file(&config, &path).unwrap();

        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
