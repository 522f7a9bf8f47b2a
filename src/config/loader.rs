//! Configuration file loader.

use std::path::{Path, PathBuf};

use crate::config::EndpointConfig;

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = ".ipc-courier.toml";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("ipc-courier").join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            search_paths: vec![path.into()],
        }
    }

    /// Load configuration from the first available file, or return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<EndpointConfig, ConfigError> {
        if let Some(path) = self.find_config_file() {
            tracing::debug!(path = %path.display(), "Loading config file");
            return Self::load_from_path(&path);
        }

        tracing::debug!("No config file found, using defaults");
        Ok(EndpointConfig::default())
    }

    fn load_from_path(path: &Path) -> Result<EndpointConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_loader_default_paths() {
        let loader = ConfigLoader::new();
        assert!(!loader.search_paths().is_empty());
        assert!(loader.search_paths()[0].ends_with(LOCAL_CONFIG_FILE));
    }

    #[test]
    fn test_config_loader_returns_defaults_when_no_file() {
        let loader = ConfigLoader::with_path("/nonexistent/path.toml");
        let config = loader.load().unwrap();
        assert_eq!(config, EndpointConfig::default());
    }

    #[test]
    fn test_config_loader_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"alpha\"\nshutdown_reason = \"bye\"").unwrap();

        let loader = ConfigLoader::with_path(file.path());
        assert_eq!(loader.find_config_file().as_deref(), Some(file.path()));

        let config = loader.load().unwrap();
        assert_eq!(config.name, "alpha");
        assert_eq!(config.shutdown_reason, "bye");
    }

    #[test]
    fn test_config_loader_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = [unterminated").unwrap();

        let err = ConfigLoader::with_path(file.path()).load().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
