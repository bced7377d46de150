//! Platform-specific paths for the local database and configuration.

use std::path::PathBuf;

const APP_DIR: &str = "BioConnect";

/// Get the platform-specific data directory for the local store
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\BioConnect
/// - macOS: ~/Library/Application Support/BioConnect
/// - Linux/Other: ~/.local/share/BioConnect
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the default local store path
pub fn get_default_database_path() -> PathBuf {
    get_data_dir().join("bioconnect.db")
}

pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Create the data directory if it does not exist yet.
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
