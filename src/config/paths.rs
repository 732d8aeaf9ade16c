//! Path management for finguard
//!
//! ## Path Resolution Order
//!
//! 1. `FINGUARD_DATA_DIR` environment variable (if set)
//! 2. Platform data directory from `directories::ProjectDirs`
//!    (e.g. `~/.local/share/finguard` on Linux)

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{FinguardError, FinguardResult};

/// Environment variable overriding the base directory
pub const DATA_DIR_VAR: &str = "FINGUARD_DATA_DIR";

/// Manages all paths used by finguard
#[derive(Debug, Clone)]
pub struct FinguardPaths {
    base_dir: PathBuf,
}

impl FinguardPaths {
    /// Resolve the base directory
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no home directory can be determined.
    pub fn new() -> FinguardResult<Self> {
        let base_dir = match std::env::var(DATA_DIR_VAR) {
            Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom),
            _ => ProjectDirs::from("ch", "finguard", "finguard")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| {
                    FinguardError::Config("Could not determine a data directory".into())
                })?,
        };

        Ok(Self { base_dir })
    }

    /// Use a custom base directory (useful for testing)
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Directory holding key metadata and backups
    pub fn keys_dir(&self) -> PathBuf {
        self.base_dir.join("keys")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Security audit log (JSONL)
    pub fn audit_log(&self) -> PathBuf {
        self.base_dir.join("audit.log")
    }

    /// Key version metadata for the local provider
    pub fn keys_file(&self) -> PathBuf {
        self.keys_dir().join("keys.json")
    }

    /// Encrypted backups of retired key versions
    pub fn key_backups_file(&self) -> PathBuf {
        self.keys_dir().join("backups.json")
    }

    /// Ensure the base and key directories exist
    pub fn ensure_directories(&self) -> FinguardResult<()> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| FinguardError::Io(format!("Failed to create base directory: {}", e)))?;

        std::fs::create_dir_all(self.keys_dir())
            .map_err(|e| FinguardError::Io(format!("Failed to create keys directory: {}", e)))?;

        Ok(())
    }

    /// Whether a settings file has been written
    pub fn is_initialized(&self) -> bool {
        self.settings_file().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_custom_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());

        assert_eq!(paths.base_dir(), temp_dir.path());
        assert_eq!(paths.keys_dir(), temp_dir.path().join("keys"));
        assert_eq!(paths.audit_log(), temp_dir.path().join("audit.log"));
    }

    #[test]
    fn test_env_var_override() {
        let temp_dir = TempDir::new().unwrap();
        let custom_path = temp_dir.path().to_str().unwrap();

        env::set_var(DATA_DIR_VAR, custom_path);
        let paths = FinguardPaths::new().unwrap();
        env::remove_var(DATA_DIR_VAR);

        assert_eq!(paths.base_dir(), temp_dir.path());
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().join("nested"));

        assert!(!paths.is_initialized());
        paths.ensure_directories().unwrap();
        assert!(paths.keys_dir().exists());
    }

    #[test]
    fn test_file_paths() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());

        assert_eq!(paths.settings_file(), temp_dir.path().join("config.json"));
        assert_eq!(
            paths.keys_file(),
            temp_dir.path().join("keys").join("keys.json")
        );
        assert_eq!(
            paths.key_backups_file(),
            temp_dir.path().join("keys").join("backups.json")
        );
    }
}
