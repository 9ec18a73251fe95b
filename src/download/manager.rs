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


//! Download manager - queue, lifecycle and storage accounting
//!
//! # Queue
//! - FIFO by admission order, one transfer active system-wide
//! - Single-flight: the `processing` flag is flipped under the queue lock,
//!   so a trigger racing with a finishing loop is never lost
//! - Failures are recorded on the task and the loop moves on
//! - Global pause and the Wi-Fi-only policy stop the loop before the next
//!   task; `resume_all_downloads` / `refresh_queue` restart it
//!
//! # Encryption
//! With `encrypt_downloads` set, a finished plaintext file is encrypted to
//! `<file>.enc` and removed before the task is marked completed. Partial
//! files are always plaintext, so pause/resume never touch ciphertext.

use crate::config::PipelineConfig;
use crate::crypto::EncryptionService;
use crate::download::progress::ProgressReporter;
use crate::download::task::{DownloadStatus, DownloadTask, MediaItem, TaskEvent};
use crate::download::transfer::{
    AbortHandle, AbortReason, AbortSignal, HttpTransfer, TransferExecutor, TransferOutcome,
    TransferRequest,
};
use crate::error::{OfflineError, Result};
use crate::file::manager::{remove_file_if_exists, FileManager};
use crate::file::paths::{download_path, encrypted_path, resume_state_path};
use crate::session::{AlwaysWifi, JellyfinUrlResolver, NetworkMonitor, SessionProvider, UrlResolver};
use crate::storage::{RecordEvent, RecordStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

/// How long cancel and clear wait for the executor to let go of its file
const RELEASE_WAIT: Duration = Duration::from_secs(2);

/// Storage accounting snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Sum of downloaded bytes over all tracked records
    pub used: u64,
    /// Free space on the download volume
    pub available: u64,
    /// Capacity of the download volume
    pub total: u64,
}

struct ActiveTransfer {
    task_id: String,
    abort: AbortHandle,
}

#[derive(Default)]
struct QueueState {
    processing: bool,
    paused_all: bool,
    /// Held by clear_all while it wipes the download directory
    suspended: bool,
    active: Option<ActiveTransfer>,
}

struct Inner {
    config: PipelineConfig,
    store: RecordStore,
    files: FileManager,
    sessions: Arc<dyn SessionProvider>,
    urls: Arc<dyn UrlResolver>,
    network: Arc<dyn NetworkMonitor>,
    executor: Arc<dyn TransferExecutor>,
    encryption: Option<EncryptionService>,
    /// Serializes dedup check and insert
    admission: Mutex<()>,
    queue: Mutex<QueueState>,
    active_id: watch::Sender<Option<String>>,
    idle: watch::Sender<bool>,
}

/// Builder for [`DownloadManager`]
pub struct DownloadManagerBuilder {
    config: PipelineConfig,
    store: RecordStore,
    sessions: Arc<dyn SessionProvider>,
    urls: Arc<dyn UrlResolver>,
    network: Arc<dyn NetworkMonitor>,
    executor: Option<Arc<dyn TransferExecutor>>,
    encryption: Option<EncryptionService>,
}

impl DownloadManagerBuilder {
    pub fn url_resolver(mut self, urls: Arc<dyn UrlResolver>) -> Self {
        self.urls = urls;
        self
    }

    pub fn network_monitor(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    /// Replace the default HTTP executor
    pub fn executor(mut self, executor: Arc<dyn TransferExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn encryption(mut self, encryption: EncryptionService) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn build(self) -> Result<DownloadManager> {
        self.config.validate()?;

        if self.config.encrypt_downloads && self.encryption.is_none() {
            return Err(OfflineError::InvalidConfiguration(
                "encrypt_downloads is set but no encryption service was provided".to_string(),
            ));
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(HttpTransfer::new(&self.config)?),
        };

        let (active_id, _) = watch::channel(None);
        let (idle, _) = watch::channel(true);

        Ok(DownloadManager {
            inner: Arc::new(Inner {
                files: FileManager::new(self.config.download_dir.clone()),
                config: self.config,
                store: self.store,
                sessions: self.sessions,
                urls: self.urls,
                network: self.network,
                executor,
                encryption: self.encryption,
                admission: Mutex::new(()),
                queue: Mutex::new(QueueState::default()),
                active_id,
                idle,
            }),
        })
    }
}

/// Download manager
///
/// Cheap to clone; clones share the queue and the record store.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn builder(
        config: PipelineConfig,
        store: RecordStore,
        sessions: Arc<dyn SessionProvider>,
    ) -> DownloadManagerBuilder {
        DownloadManagerBuilder {
            config,
            store,
            sessions,
            urls: Arc::new(JellyfinUrlResolver::default()),
            network: Arc::new(AlwaysWifi),
            executor: None,
            encryption: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Queue an item for download
    ///
    /// Returns the id of the task that owns the item: an existing completed
    /// or in-flight task when there is one, otherwise a new pending task. A
    /// failed task for the item is replaced.
    ///
    /// # Errors
    /// - `ServerNotFound` if the server has no session; no record is created
    /// - `InvalidDownloadUrl` if no download URL can be built for the item
    pub async fn start_download(&self, item: &MediaItem, server_id: &str) -> Result<String> {
        let inner = &self.inner;
        let server = inner
            .sessions
            .server(server_id)
            .ok_or_else(|| OfflineError::ServerNotFound(server_id.to_string()))?;
        inner.urls.download_url(&server, item)?;

        let admission = inner.admission.lock().await;

        if let Some(existing) = inner.store.find_by_item(&item.id).await? {
            match existing.status {
                DownloadStatus::Failed => {
                    debug!(task_id = %existing.id, item_id = %item.id, "replacing failed task");
                    inner.store.remove(&existing.id).await?;
                }
                _ => {
                    debug!(task_id = %existing.id, item_id = %item.id, status = %existing.status, "item already tracked");
                    return Ok(existing.id);
                }
            }
        }

        let estimate = item
            .size_hint
            .filter(|size| *size > 0)
            .unwrap_or(inner.config.default_size_estimate);
        let task = inner.store.insert_pending(item, server_id, estimate).await?;
        drop(admission);

        info!(task_id = %task.id, item_id = %item.id, "download queued");
        self.trigger_queue().await;

        Ok(task.id)
    }

    /// Queue several items for the same server
    pub async fn start_batch_download(
        &self,
        items: &[MediaItem],
        server_id: &str,
    ) -> Result<Vec<String>> {
        if self.inner.sessions.server(server_id).is_none() {
            return Err(OfflineError::ServerNotFound(server_id.to_string()));
        }

        let mut task_ids = Vec::with_capacity(items.len());
        for item in items {
            task_ids.push(self.start_download(item, server_id).await?);
        }
        Ok(task_ids)
    }

    /// Stop a pending or downloading task, keeping its partial file
    pub async fn pause_download(&self, task_id: &str) -> Result<()> {
        self.inner.store.apply(task_id, TaskEvent::Pause).await?;
        self.abort_if_active(task_id, AbortReason::Pause).await;
        info!(task_id, "download paused");
        Ok(())
    }

    /// Put a paused task back into the queue
    pub async fn resume_download(&self, task_id: &str) -> Result<()> {
        self.inner.store.apply(task_id, TaskEvent::Resume).await?;
        info!(task_id, "download resumed");
        self.trigger_queue().await;
        Ok(())
    }

    /// Put a failed task back into the queue
    pub async fn retry_download(&self, task_id: &str) -> Result<()> {
        self.inner.store.apply(task_id, TaskEvent::Retry).await?;
        info!(task_id, "download retried");
        self.trigger_queue().await;
        Ok(())
    }

    /// Abort and forget a task that has not completed
    ///
    /// Removes the record and any partial file.
    pub async fn cancel_download(&self, task_id: &str) -> Result<()> {
        let task = self.inner.store.get(task_id).await?;
        if !task.status.is_active() {
            return Err(OfflineError::InvalidTransition {
                from: task.status.to_string(),
                event: "cancel".to_string(),
            });
        }

        self.remove_task(&task, AbortReason::Cancel).await?;
        info!(task_id, item_id = %task.item_id, "download cancelled");
        Ok(())
    }

    /// Remove a task in any state together with its file
    pub async fn delete_download(&self, task_id: &str) -> Result<()> {
        let task = self.inner.store.get(task_id).await?;
        self.remove_task(&task, AbortReason::Cancel).await?;
        info!(task_id, item_id = %task.item_id, "download deleted");
        Ok(())
    }

    async fn remove_task(&self, task: &DownloadTask, reason: AbortReason) -> Result<()> {
        if self.abort_if_active(&task.id, reason).await {
            self.wait_for_release(&task.id).await;
        }

        self.inner.store.remove(&task.id).await?;
        self.remove_task_files(task).await
    }

    /// Delete every file a task may own; missing files are fine
    async fn remove_task_files(&self, task: &DownloadTask) -> Result<()> {
        let destination = download_path(&self.inner.config.download_dir, &task.media_item());

        let mut paths = vec![
            encrypted_path(&destination),
            resume_state_path(&destination),
            destination,
        ];
        if let Some(local_path) = task.local_path.as_deref().map(PathBuf::from) {
            if !paths.contains(&local_path) {
                paths.push(local_path);
            }
        }

        for path in &paths {
            remove_file_if_exists(path).await?;
        }
        Ok(())
    }

    /// Stop the queue and pause every pending or downloading task
    pub async fn pause_all_downloads(&self) -> Result<usize> {
        self.inner.queue.lock().await.paused_all = true;

        let mut paused = 0;
        for task in self.inner.store.list(None).await? {
            if matches!(task.status, DownloadStatus::Pending | DownloadStatus::Downloading) {
                match self.pause_download(&task.id).await {
                    Ok(()) => paused += 1,
                    // Finished or removed in the meantime
                    Err(e) => debug!(task_id = %task.id, error = %e, "task not paused"),
                }
            }
        }

        info!(paused, "all downloads paused");
        Ok(paused)
    }

    /// Lift the global pause and requeue every paused task
    pub async fn resume_all_downloads(&self) -> Result<usize> {
        self.inner.queue.lock().await.paused_all = false;

        let mut resumed = 0;
        for task in self.inner.store.list(Some(DownloadStatus::Paused)).await? {
            match self.inner.store.apply(&task.id, TaskEvent::Resume).await {
                Ok(_) => resumed += 1,
                Err(e) => debug!(task_id = %task.id, error = %e, "task not resumed"),
            }
        }

        info!(resumed, "all downloads resumed");
        self.trigger_queue().await;
        Ok(resumed)
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.queue.lock().await.paused_all
    }

    /// Whether the queue may start another transfer right now
    pub async fn can_start_download(&self) -> bool {
        let queue = self.inner.queue.lock().await;
        self.can_start(&queue)
    }

    fn can_start(&self, queue: &QueueState) -> bool {
        if queue.paused_all || queue.suspended {
            return false;
        }
        if self.inner.config.wifi_only && !self.inner.network.is_on_wifi() {
            debug!("waiting for Wi-Fi before starting downloads");
            return false;
        }
        true
    }

    /// Run the queue again, e.g. after the device joined Wi-Fi
    pub async fn refresh_queue(&self) {
        self.trigger_queue().await;
    }

    /// Requeue tasks left downloading by a previous process
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let active = self.active_download_id();
        let mut recovered = 0;

        for task in self.inner.store.list(Some(DownloadStatus::Downloading)).await? {
            if active.as_deref() == Some(task.id.as_str()) {
                continue;
            }
            self.inner.store.apply(&task.id, TaskEvent::Interrupt).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "requeued interrupted downloads");
        }
        self.trigger_queue().await;
        Ok(recovered)
    }

    /// Delete completed downloads of items the user has finished
    pub async fn remove_watched_downloads(&self, watched_item_ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for task in self.inner.store.list(Some(DownloadStatus::Completed)).await? {
            if watched_item_ids.contains(&task.item_id) {
                self.delete_download(&task.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Path of the completed download for an item
    pub async fn get_local_path(&self, item_id: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .inner
            .store
            .find_completed(item_id)
            .await?
            .and_then(|task| task.local_path)
            .map(PathBuf::from))
    }

    pub async fn is_downloaded(&self, item_id: &str) -> Result<bool> {
        Ok(self.inner.store.find_completed(item_id).await?.is_some())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<DownloadTask> {
        self.inner.store.get(task_id).await
    }

    /// All tasks in admission order
    pub async fn list_downloads(&self) -> Result<Vec<DownloadTask>> {
        self.inner.store.list(None).await
    }

    /// Task currently bound to the executor
    pub fn active_download_id(&self) -> Option<String> {
        self.inner.active_id.borrow().clone()
    }

    /// Record changes for UI observers
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.inner.store.subscribe()
    }

    pub async fn get_storage_info(&self) -> Result<StorageInfo> {
        let used = self.inner.store.used_storage().await?;
        let disk = self.inner.files.disk_space()?;

        Ok(StorageInfo {
            used,
            available: disk.available,
            total: disk.total,
        })
    }

    /// Abort everything, wipe the download directory and forget all tasks
    ///
    /// Records are removed even when the directory cannot be reset; that
    /// error is returned afterwards.
    pub async fn clear_all_downloads(&self) -> Result<()> {
        let _admission = self.inner.admission.lock().await;

        {
            let mut queue = self.inner.queue.lock().await;
            queue.suspended = true;
            if let Some(active) = &queue.active {
                active.abort.abort(AbortReason::Clear);
            }
        }
        self.wait_for_idle_timeout(RELEASE_WAIT).await;

        let files_result = self.inner.files.reset_root().await;
        let store_result = self.inner.store.clear().await;
        self.inner.queue.lock().await.suspended = false;

        let cleared = store_result?;
        if let Err(ref e) = files_result {
            error!(error = %e, "download directory could not be reset");
        }
        info!(cleared, "all downloads cleared");
        files_result
    }

    /// Wait until the queue has nothing left it can start
    pub async fn wait_for_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    async fn wait_for_idle_timeout(&self, limit: Duration) {
        if tokio::time::timeout(limit, self.wait_for_idle()).await.is_err() {
            warn!("queue did not stop in time");
        }
    }

    async fn wait_for_release(&self, task_id: &str) {
        let mut active = self.inner.active_id.subscribe();
        let released = active.wait_for(|id| id.as_deref() != Some(task_id));

        if tokio::time::timeout(RELEASE_WAIT, released).await.is_err() {
            warn!(task_id, "transfer did not stop in time");
        }
    }

    /// Raise the abort signal if `task_id` is the bound task
    async fn abort_if_active(&self, task_id: &str, reason: AbortReason) -> bool {
        let queue = self.inner.queue.lock().await;
        match &queue.active {
            Some(active) if active.task_id == task_id => {
                active.abort.abort(reason);
                true
            }
            _ => false,
        }
    }

    async fn trigger_queue(&self) {
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.processing {
                return;
            }
            queue.processing = true;
            self.inner.idle.send_replace(false);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.process_queue().await;
        });
    }

    async fn process_queue(&self) {
        loop {
            let (task, signal) = {
                let mut queue = self.inner.queue.lock().await;

                let next = if self.can_start(&queue) {
                    self.inner.store.next_pending().await
                } else {
                    Ok(None)
                };

                let task = match next {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        queue.processing = false;
                        self.inner.idle.send_replace(true);
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read the download queue");
                        queue.processing = false;
                        self.inner.idle.send_replace(true);
                        return;
                    }
                };

                let (abort, signal) = AbortSignal::new();
                queue.active = Some(ActiveTransfer {
                    task_id: task.id.clone(),
                    abort,
                });
                self.inner.active_id.send_replace(Some(task.id.clone()));
                (task, signal)
            };

            self.run_task(task, signal).await;

            self.inner.queue.lock().await.active = None;
            self.inner.active_id.send_replace(None);
        }
    }

    async fn run_task(&self, task: DownloadTask, signal: AbortSignal) {
        let store = &self.inner.store;
        let task_id = task.id.as_str();

        // Paused or removed after it was picked
        let started = match store.apply(task_id, TaskEvent::Start).await {
            Ok(started) => started,
            Err(e) => {
                debug!(task_id, error = %e, "skipping task");
                return;
            }
        };
        info!(task_id, item_id = %started.item_id, "download started");

        match self.execute(&started, signal).await {
            Ok(Some((local_path, bytes))) => {
                match self.record_completion(task_id, &local_path, bytes).await {
                    Ok(_) => info!(task_id, bytes, "download completed"),
                    Err(OfflineError::TaskNotFound(_)) => {
                        // Cancelled while finishing; do not leave the file behind
                        if let Err(e) = remove_file_if_exists(&local_path).await {
                            warn!(task_id, error = %e, "orphaned download not removed");
                        }
                    }
                    Err(e) => warn!(task_id, error = %e, "completed transfer not recorded"),
                }
            }
            Ok(None) => debug!(task_id, "transfer stopped before completion"),
            Err(e) => {
                warn!(task_id, error = %e, "download failed");
                if let Err(e) = store.fail(task_id, &e.user_message()).await {
                    debug!(task_id, error = %e, "failure not recorded");
                }
            }
        }
    }

    /// Mark a finished transfer completed
    ///
    /// A pause that arrived after the last byte completes from `Paused`. If
    /// the task was also resumed in the meantime it is started again first,
    /// so the file on disk is never downloaded twice.
    async fn record_completion(
        &self,
        task_id: &str,
        local_path: &Path,
        bytes: u64,
    ) -> Result<DownloadTask> {
        let store = &self.inner.store;
        let path_str = local_path.to_string_lossy();

        match store.complete(task_id, &path_str, bytes).await {
            Err(OfflineError::InvalidTransition { .. })
                if store.get(task_id).await?.status == DownloadStatus::Pending =>
            {
                debug!(task_id, "resumed after finishing, recording completion");
                store.apply(task_id, TaskEvent::Start).await?;
                store.complete(task_id, &path_str, bytes).await
            }
            result => result,
        }
    }

    /// Run the executor for a started task
    ///
    /// Returns the final local path and byte count, or `None` if the
    /// transfer was aborted.
    async fn execute(
        &self,
        task: &DownloadTask,
        signal: AbortSignal,
    ) -> Result<Option<(PathBuf, u64)>> {
        let inner = &self.inner;
        let server = inner
            .sessions
            .server(&task.server_id)
            .ok_or_else(|| OfflineError::ServerNotFound(task.server_id.clone()))?;

        let item = task.media_item();
        let url = inner.urls.download_url(&server, &item)?;
        let destination = download_path(&inner.config.download_dir, &item);
        inner.files.ensure_root().await?;

        let request = TransferRequest {
            url,
            headers: server.auth_headers(),
            destination: destination.clone(),
        };

        let (reporter, mut progress) = ProgressReporter::channel(inner.config.progress_interval());
        let transfer = inner.executor.transfer(request, reporter, signal);

        // Ends once the executor drops its reporter
        let drain = async {
            while progress.changed().await.is_ok() {
                let bytes = *progress.borrow_and_update();
                if let Err(e) = inner.store.update_progress(&task.id, bytes).await {
                    warn!(task_id = %task.id, error = %e, "progress not recorded");
                }
            }
        };

        let (outcome, ()) = tokio::join!(transfer, drain);

        match outcome? {
            TransferOutcome::Aborted {
                bytes_written,
                reason,
            } => {
                debug!(task_id = %task.id, bytes_written, ?reason, "transfer aborted");
                Ok(None)
            }
            TransferOutcome::Completed { bytes_written } => {
                let local_path = self.seal(&destination).await?;
                Ok(Some((local_path, bytes_written)))
            }
        }
    }

    /// Encrypt a finished file when encryption at rest is enabled
    async fn seal(&self, plaintext: &Path) -> Result<PathBuf> {
        let encryption = match (&self.inner.encryption, self.inner.config.encrypt_downloads) {
            (Some(encryption), true) => encryption,
            _ => return Ok(plaintext.to_path_buf()),
        };

        let sealed = encrypted_path(plaintext);
        encryption.encrypt_file(plaintext, &sealed).await?;
        remove_file_if_exists(plaintext).await?;
        Ok(sealed)
    }
}
