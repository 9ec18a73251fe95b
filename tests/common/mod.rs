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


//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use media_offline_core::crypto::{EncryptionService, KeyStore, MemorySecureStore};
use media_offline_core::download::{
    AbortSignal, DownloadManager, ProgressReporter, TransferExecutor, TransferOutcome,
    TransferRequest,
};
use media_offline_core::session::{ServerContext, StaticSessions};
use media_offline_core::storage::{Database, RecordStore};
use media_offline_core::{PipelineConfig, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const SERVER_ID: &str = "home";

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// In-process executor that streams a fixed payload in timed chunks
///
/// Resumes from the length of an existing partial file and stops between
/// chunks when aborted, like the HTTP executor does.
pub struct SimulatedTransport {
    content: Vec<u8>,
    chunk_size: usize,
    delay: Duration,
    calls: AtomicUsize,
}

impl SimulatedTransport {
    pub fn new(content: Vec<u8>, chunk_size: usize, delay: Duration) -> Self {
        Self {
            content,
            chunk_size,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferExecutor for SimulatedTransport {
    async fn transfer(
        &self,
        request: TransferRequest,
        mut progress: ProgressReporter,
        abort: AbortSignal,
    ) -> Result<TransferOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.destination)
            .await?;
        let mut written = file.metadata().await?.len().min(self.content.len() as u64);
        progress.report(written);

        while (written as usize) < self.content.len() {
            if let Some(reason) = abort.reason() {
                file.flush().await?;
                return Ok(TransferOutcome::Aborted {
                    bytes_written: written,
                    reason,
                });
            }

            let start = written as usize;
            let end = (start + self.chunk_size).min(self.content.len());
            file.write_all(&self.content[start..end]).await?;
            written = end as u64;
            progress.report(written);

            tokio::time::sleep(self.delay).await;
        }

        file.flush().await?;
        progress.finish();
        Ok(TransferOutcome::Completed {
            bytes_written: written,
        })
    }
}

pub fn sessions() -> Arc<StaticSessions> {
    Arc::new(StaticSessions::new().with_server(ServerContext {
        server_id: SERVER_ID.to_string(),
        base_url: "http://media.local".to_string(),
        access_token: "test-token".to_string(),
        user_id: Some("user-1".to_string()),
    }))
}

pub fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::for_root(root);
    config.progress_interval_ms = 10;
    config
}

pub fn encryption() -> EncryptionService {
    EncryptionService::new(Arc::new(KeyStore::new(Arc::new(MemorySecureStore::new()))))
}

pub async fn manager(
    config: PipelineConfig,
    executor: Arc<dyn TransferExecutor>,
) -> DownloadManager {
    manager_with_encryption(config, executor, encryption()).await
}

pub async fn manager_with_encryption(
    config: PipelineConfig,
    executor: Arc<dyn TransferExecutor>,
    encryption: EncryptionService,
) -> DownloadManager {
    let db = Database::new(&config.database_path).await.unwrap();

    DownloadManager::builder(config, RecordStore::new(&db), sessions())
        .executor(executor)
        .encryption(encryption)
        .build()
        .unwrap()
}
