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


//! Decrypted-cache materializer
//!
//! Players and readers cannot open `.enc` blobs. They ask for a plaintext
//! copy in a scratch directory, which is produced once and reused until
//! the cache is cleared.

use crate::error::Result;
use crate::file::manager::{ensure_directory_exists, file_exists, remove_dir_if_exists};
use crate::file::paths::cache_entry_name;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Decrypt primitive the cache delegates to
#[async_trait]
pub trait BlobDecryptor: Send + Sync {
    async fn decrypt_file(&self, src: &Path, dest: &Path) -> Result<()>;
}

pub struct DecryptedCache {
    dir: PathBuf,
    decryptor: Arc<dyn BlobDecryptor>,
    // Serializes materialization so one entry is never decrypted twice
    materialize: Mutex<()>,
}

impl DecryptedCache {
    pub fn new(dir: impl Into<PathBuf>, decryptor: Arc<dyn BlobDecryptor>) -> Self {
        Self {
            dir: dir.into(),
            decryptor,
            materialize: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Plaintext path for an encrypted file, decrypting on first access
    pub async fn get_decrypted_uri(&self, encrypted: &Path) -> Result<PathBuf> {
        let target = self.dir.join(cache_entry_name(encrypted));

        let _guard = self.materialize.lock().await;
        if file_exists(&target).await {
            return Ok(target);
        }

        ensure_directory_exists(&self.dir).await?;
        self.decryptor.decrypt_file(encrypted, &target).await?;
        debug!(src = %encrypted.display(), entry = %target.display(), "materialized decrypted copy");

        Ok(target)
    }

    /// Remove every materialized file
    pub async fn clear_decrypted_cache(&self) -> Result<()> {
        let _guard = self.materialize.lock().await;
        remove_dir_if_exists(&self.dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Copies the source and counts invocations
    #[derive(Default)]
    struct CountingDecryptor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobDecryptor for CountingDecryptor {
        async fn decrypt_file(&self, src: &Path, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(src, dest).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_second_access_reuses_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("item.epub.enc");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let decryptor = Arc::new(CountingDecryptor::default());
        let cache = DecryptedCache::new(temp_dir.path().join("scratch"), decryptor.clone());

        let first = cache.get_decrypted_uri(&source).await.unwrap();
        let second = cache.get_decrypted_uri(&source).await.unwrap();

        assert_eq!(first, second);
        assert!(first.to_string_lossy().ends_with("_item.epub"));
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_forces_new_decrypt() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("item.mp3.enc");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let decryptor = Arc::new(CountingDecryptor::default());
        let cache = DecryptedCache::new(temp_dir.path().join("scratch"), decryptor.clone());

        cache.get_decrypted_uri(&source).await.unwrap();
        cache.clear_decrypted_cache().await.unwrap();
        assert!(!cache.dir().exists());

        cache.get_decrypted_uri(&source).await.unwrap();
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_without_cache_dir_is_ok() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = DecryptedCache::new(
            temp_dir.path().join("never-created"),
            Arc::new(CountingDecryptor::default()),
        );
        cache.clear_decrypted_cache().await.unwrap();
    }
}
