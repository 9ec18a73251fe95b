// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Pipeline configuration
//!
//! # Locations
//! - Desktop (macOS): ~/Library/Application Support/MediaOffline/
//! - Desktop (Linux): ~/.local/share/MediaOffline/
//! - Desktop (Windows): %APPDATA%/MediaOffline/
//! - Android/iOS: the host app passes its own root via [`PipelineConfig::for_root`]

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size recorded for items whose server reports no size (500 MiB)
pub const DEFAULT_SIZE_ESTIMATE: u64 = 500 * 1024 * 1024;

/// Configuration shared by the download manager and encryption service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding `<itemId>.<ext>` content files
    pub download_dir: PathBuf,

    /// Scratch directory for decrypted materializations
    pub cache_dir: PathBuf,

    /// SQLite database holding the download records
    pub database_path: PathBuf,

    /// Directory used by the file-backed secure store
    pub key_store_dir: PathBuf,

    /// Size estimate when the server provides none
    pub default_size_estimate: u64,

    /// Encrypt completed downloads at rest
    pub encrypt_downloads: bool,

    /// Only start transfers while on Wi-Fi
    pub wifi_only: bool,

    /// Transient failure retries inside one transfer
    pub max_retries: u32,

    /// Minimum interval between progress updates
    pub progress_interval_ms: u64,

    /// Seconds a transfer may go without receiving data before it is retried
    pub idle_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_root(Self::default_root())
    }
}

impl PipelineConfig {
    /// Derive every location from a single root directory
    pub fn for_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            download_dir: root.join("downloads"),
            cache_dir: root.join("cache").join("decrypted"),
            database_path: root.join("downloads.db"),
            key_store_dir: root.join("keys"),
            default_size_estimate: DEFAULT_SIZE_ESTIMATE,
            encrypt_downloads: false,
            wifi_only: false,
            max_retries: 3,
            progress_interval_ms: 200,
            idle_timeout_secs: 60,
        }
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| OfflineError::file_io("Failed to read config", path, e))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("download_dir", &self.download_dir),
            ("cache_dir", &self.cache_dir),
            ("database_path", &self.database_path),
            ("key_store_dir", &self.key_store_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(OfflineError::InvalidConfiguration(format!("{} is empty", name)));
            }
        }

        if self.download_dir == self.cache_dir {
            return Err(OfflineError::InvalidConfiguration(
                "download_dir and cache_dir must differ".to_string(),
            ));
        }

        if self.idle_timeout_secs == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "idle_timeout_secs must be positive".to_string(),
            ));
        }

        if self.progress_interval_ms == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "progress_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Platform application data directory
    pub fn default_root() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("MediaOffline")
        }

        #[cfg(target_os = "linux")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local").join("share").join("MediaOffline")
        }

        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(appdata).join("MediaOffline")
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            // Mobile hosts override this with their sandbox directory
            PathBuf::from("./MediaOffline")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_root_layout() {
        let config = PipelineConfig::for_root("/data/app");
        assert_eq!(config.download_dir, PathBuf::from("/data/app/downloads"));
        assert_eq!(config.cache_dir, PathBuf::from("/data/app/cache/decrypted"));
        assert_eq!(config.default_size_estimate, 500 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"encrypt_downloads": true, "max_retries": 7}"#).unwrap();
        assert!(config.encrypt_downloads);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.progress_interval_ms, 200);
    }

    #[test]
    fn test_validate_rejects_shared_dirs() {
        let mut config = PipelineConfig::for_root("/tmp/x");
        config.cache_dir = config.download_dir.clone();
        assert!(matches!(
            config.validate(),
            Err(OfflineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = PipelineConfig::for_root(dir.path());
        config.wifi_only = true;
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert!(loaded.wifi_only);
        assert_eq!(loaded.download_dir, dir.path().join("downloads"));
    }
}
