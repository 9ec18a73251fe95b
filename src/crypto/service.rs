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


//! File encryption and decryption at rest

use crate::crypto::cache::BlobDecryptor;
use crate::crypto::cipher;
use crate::crypto::key_store::KeyStore;
use crate::error::{OfflineError, Result};
use crate::file::manager::atomic_write;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Encrypts and decrypts whole files with the install key
///
/// Every operation initializes the key store first, so the first call on a
/// fresh install creates the key.
#[derive(Clone)]
pub struct EncryptionService {
    keys: Arc<KeyStore>,
}

impl EncryptionService {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.keys.initialize().await
    }

    /// Write `IV || ciphertext` of `src` to `dest`
    pub async fn encrypt_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let key = self.keys.key().await?;
        let plaintext = read_source(src).await?;

        let blob = cipher::encrypt(key, &plaintext);
        atomic_write(dest, &blob).await?;

        debug!(src = %src.display(), dest = %dest.display(), bytes = plaintext.len(), "encrypted file");
        Ok(())
    }

    /// Write the plaintext of blob `src` to `dest`
    pub async fn decrypt_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let key = self.keys.key().await?;
        let blob = read_source(src).await?;

        let plaintext = cipher::decrypt(key, &blob)?;
        atomic_write(dest, &plaintext).await?;

        debug!(src = %src.display(), dest = %dest.display(), bytes = plaintext.len(), "decrypted file");
        Ok(())
    }
}

#[async_trait]
impl BlobDecryptor for EncryptionService {
    async fn decrypt_file(&self, src: &Path, dest: &Path) -> Result<()> {
        EncryptionService::decrypt_file(self, src, dest).await
    }
}

async fn read_source(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            OfflineError::FileNotFound(path.display().to_string())
        } else {
            OfflineError::file_io("Failed to read", path, e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::IV_LEN;
    use crate::crypto::key_store::MemorySecureStore;

    fn service() -> EncryptionService {
        EncryptionService::new(Arc::new(KeyStore::new(Arc::new(MemorySecureStore::new()))))
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let plain = temp_dir.path().join("a.mp3");
        let blob = temp_dir.path().join("a.mp3.enc");
        let restored = temp_dir.path().join("restored.mp3");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&plain, &data).await.unwrap();

        let service = service();
        service.encrypt_file(&plain, &blob).await.unwrap();
        service.decrypt_file(&blob, &restored).await.unwrap();

        assert_eq!(tokio::fs::read(&blob).await.unwrap().len(), IV_LEN + data.len());
        assert_eq!(tokio::fs::read(&restored).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_source_is_file_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = service()
            .encrypt_file(&temp_dir.path().join("missing"), &temp_dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_truncated_blob_is_malformed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let blob = temp_dir.path().join("short.enc");
        tokio::fs::write(&blob, [0u8; 5]).await.unwrap();

        let err = service()
            .decrypt_file(&blob, &temp_dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::MalformedBlob { len: 5 }));
    }
}
