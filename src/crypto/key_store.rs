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


//! Encryption key lifecycle
//!
//! # Storage
//! - One key per install, stored base64 under a stable alias
//! - Created on first use, never rotated
//! - Losing the stored entry strands every file encrypted with it
//! - Never log or expose the key

use crate::crypto::cipher::EncryptionKey;
use crate::error::{OfflineError, Result};
use crate::file::manager::{atomic_write_private, ensure_directory_exists};
use crate::file::paths::sanitize_filename;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

/// Alias the install key is stored under
pub const KEY_ALIAS: &str = "media_offline.encryption_key";

/// Credential storage backing the key
///
/// On devices this is the platform keychain or keystore, bridged in by the
/// host app. [`FileSecureStore`] covers desktop use.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, alias: &str) -> Result<Option<String>>;
    async fn set(&self, alias: &str, value: &str) -> Result<()>;
    async fn delete(&self, alias: &str) -> Result<()>;
}

/// One owner-only file per alias
#[derive(Debug, Clone)]
pub struct FileSecureStore {
    dir: PathBuf,
}

impl FileSecureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, alias: &str) -> PathBuf {
        self.dir.join(sanitize_filename(alias))
    }
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn get(&self, alias: &str) -> Result<Option<String>> {
        let path = self.entry_path(alias);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OfflineError::KeyUnavailable(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set(&self, alias: &str, value: &str) -> Result<()> {
        ensure_directory_exists(&self.dir).await?;
        let path = self.entry_path(alias);
        atomic_write_private(&path, value.as_bytes()).await
    }

    async fn delete(&self, alias: &str) -> Result<()> {
        crate::file::manager::remove_file_if_exists(&self.entry_path(alias)).await?;
        Ok(())
    }
}

/// Process-local store for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| OfflineError::KeyUnavailable("secure store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, alias: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(alias).cloned())
    }

    async fn set(&self, alias: &str, value: &str) -> Result<()> {
        self.lock()?.insert(alias.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, alias: &str) -> Result<()> {
        self.lock()?.remove(alias);
        Ok(())
    }
}

/// Holds the install key once loaded
pub struct KeyStore {
    store: Arc<dyn SecureStore>,
    alias: String,
    key: OnceCell<EncryptionKey>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self::with_alias(store, KEY_ALIAS)
    }

    pub fn with_alias(store: Arc<dyn SecureStore>, alias: impl Into<String>) -> Self {
        Self {
            store,
            alias: alias.into(),
            key: OnceCell::new(),
        }
    }

    /// Load or create the key
    ///
    /// No-op once a key is held. Concurrent first calls share one load, so
    /// two keys are never generated by the same process.
    pub async fn initialize(&self) -> Result<()> {
        self.key().await.map(|_| ())
    }

    /// The install key, initializing on first use
    pub async fn key(&self) -> Result<&EncryptionKey> {
        self.key.get_or_try_init(|| self.load_or_create()).await
    }

    pub fn is_initialized(&self) -> bool {
        self.key.initialized()
    }

    async fn load_or_create(&self) -> Result<EncryptionKey> {
        if let Some(encoded) = self.store.get(&self.alias).await? {
            let bytes = STANDARD.decode(encoded.as_bytes())?;
            return EncryptionKey::from_slice(&bytes);
        }

        let key = EncryptionKey::generate();
        self.store
            .set(&self.alias, &STANDARD.encode(key.as_bytes()))
            .await
            .map_err(|e| OfflineError::KeyUnavailable(format!("cannot persist key: {}", e)))?;

        info!(alias = %self.alias, "generated new encryption key");
        Ok(key)
    }
}
