//! Application configuration loaded from TOML.

use crate::biometric::{DEFAULT_ACCEPT_THRESHOLD, DEFAULT_TEMPLATE_LENGTH};
use crate::platform;
use crate::sync::SyncConfig;
use crate::{BioConnectError, MatchEngine, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Base URL of the remote directory. Replication is disabled when unset.
    pub remote_url: Option<String>,
    /// Maximum Euclidean distance accepted as the same person (exclusive).
    pub accept_threshold: f32,
    pub template_length: usize,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: platform::get_default_database_path(),
            remote_url: None,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            template_length: DEFAULT_TEMPLATE_LENGTH,
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BioConnectError::Config(format!("{}: {}", path.display(), e)))?;
        config.matcher()?;
        config.sync.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Matcher configured with this threshold and template length.
    pub fn matcher(&self) -> Result<MatchEngine> {
        MatchEngine::new(self.accept_threshold, self.template_length)
            .map_err(|e| BioConnectError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.accept_threshold, 0.6);
        assert_eq!(config.template_length, 128);
        assert!(config.remote_url.is_none());
        assert!(config.matcher().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "remote_url = \"http://directory.local\"\naccept_threshold = 0.5\n\n[sync]\nbackoff_max_secs = 60"
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("http://directory.local"));
        assert_eq!(config.accept_threshold, 0.5);
        assert_eq!(config.template_length, 128);
        assert_eq!(config.sync.backoff_max_secs, 60);
        assert_eq!(config.sync.backoff_base_secs, 5);
    }

    #[test]
    fn test_invalid_threshold_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "accept_threshold = -1.0").unwrap();

        assert!(matches!(
            AppConfig::load(file.path()),
            Err(BioConnectError::Config(_))
        ));
    }

    #[test]
    fn test_zero_backoff_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nbackoff_base_secs = 0").unwrap();

        assert!(matches!(
            AppConfig::load(file.path()),
            Err(BioConnectError::Config(_))
        ));
    }

    #[test]
    fn test_zero_replicate_timeout_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nreplicate_timeout_secs = 0").unwrap();

        assert!(matches!(
            AppConfig::load(file.path()),
            Err(BioConnectError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
