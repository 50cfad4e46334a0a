//! FOX-DIE Path utilities

use std::path::PathBuf;

/// Environment override for the error archive location.
pub const DB_PATH_ENV: &str = "SAMGUARD_DB_PATH";

/// FOX-DIE secure data vault (~/.samguard)
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("◆ FAILED TO LOCATE HOME BASE")
        .join(".samguard")
}

/// Guard parameters location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Error archive location, honoring the `SAMGUARD_DB_PATH` override
pub fn default_db_path() -> PathBuf {
    match std::env::var(DB_PATH_ENV) {
        Ok(custom) => PathBuf::from(custom),
        Err(_) => data_dir().join("errors.db"),
    }
}

/// Ensure directory exists
pub async fn ensure_dir(path: &PathBuf) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}
