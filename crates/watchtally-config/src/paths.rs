use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// Container base path override, defaulting to "/app".
pub fn container_base_path() -> PathBuf {
    std::env::var("WATCHTALLY_BASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/app"))
}

pub struct PathManager {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl PathManager {
    pub fn new() -> Result<Self, ConfigError> {
        let base_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::Invalid("could not determine config directory".to_string()))?
            .join("watchtally");

        Ok(Self {
            config_dir: base_dir.clone(),
            data_dir: base_dir.join("data"),
            log_dir: base_dir.join("logs"),
        })
    }

    pub fn from_container_env() -> Self {
        let base = container_base_path();
        Self {
            config_dir: base.clone(),
            data_dir: base.join("data"),
            log_dir: base.join("logs"),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn state_db_file(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

impl Default for PathManager {
    fn default() -> Self {
        // The container base directory is created by the Containerfile, so
        // its presence selects the container layout.
        let base = container_base_path();
        if base.exists() {
            return Self::from_container_env();
        }
        Self::new().unwrap_or_else(|_| Self::from_container_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_layout_nests_data_and_logs() {
        let manager = PathManager::from_container_env();
        assert!(manager.state_db_file().ends_with("data/state.db"));
        assert!(manager.config_file().ends_with("config.toml"));
    }
}
