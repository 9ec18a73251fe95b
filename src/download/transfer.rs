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


//! Transfer executor with resume support
//!
//! # Resume Mechanism
//! 1. The resume cursor is the length of the partial file on disk
//! 2. Send `Range: bytes={cursor}-`
//! 3. `206 Partial Content`: check `Content-Range` against the sidecar
//!    and append
//! 4. `200 OK`: the server ignored the range, truncate and start over
//! 5. `416`: the partial file already holds the whole resource
//!
//! A JSON sidecar (`<file>.download_state.json`) remembers the total size
//! across process restarts and is removed once the file is complete.
//!
//! There is no overall request deadline. A response or body that goes
//! quiet for longer than the idle timeout counts as a transient network
//! error and is retried from the bytes already on disk.

use crate::config::PipelineConfig;
use crate::download::progress::ProgressReporter;
use crate::error::{OfflineError, Result};
use crate::file::manager::{ensure_directory_exists, file_size_or_zero, remove_file_if_exists};
use crate::file::paths::resume_state_path;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Write buffer size
const DOWNLOAD_BUFF_SZ: usize = 8 * 1024;
/// Flush to disk every 1 MB
const DATA_FLUSH_SZ: u64 = 1024 * 1024;
/// Cap for the exponential retry backoff
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Times a changed remote resource may force a restart within one transfer
const MAX_RESTARTS: u32 = 1;
/// TCP connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default for how long a response may stay silent
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a transfer was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Keep the partial file for a later resume
    Pause,
    /// Partial file is about to be deleted
    Cancel,
    /// Every download is being wiped
    Clear,
}

/// Sending half of an abort signal, held by the manager
#[derive(Debug)]
pub struct AbortHandle {
    sender: watch::Sender<Option<AbortReason>>,
}

impl AbortHandle {
    pub fn abort(&self, reason: AbortReason) {
        self.sender.send_replace(Some(reason));
    }
}

/// Cooperative abort signal checked by executors between chunks
#[derive(Debug, Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<Option<AbortReason>>,
}

impl AbortSignal {
    pub fn new() -> (AbortHandle, AbortSignal) {
        let (sender, receiver) = watch::channel(None);
        (AbortHandle { sender }, AbortSignal { receiver })
    }

    /// Signal that is never raised
    pub fn never() -> AbortSignal {
        AbortSignal::new().1
    }

    /// Abort reason, if one was raised
    pub fn reason(&self) -> Option<AbortReason> {
        *self.receiver.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until an abort is raised
    ///
    /// Never resolves if the handle was dropped without aborting.
    pub async fn aborted(&mut self) -> AbortReason {
        loop {
            if let Some(reason) = *self.receiver.borrow_and_update() {
                return reason;
            }
            if self.receiver.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    /// Extra request headers (auth)
    pub headers: HashMap<String, String>,
    /// Final location of the plaintext file
    pub destination: PathBuf,
}

/// Result of a transfer that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Destination holds the whole resource
    Completed { bytes_written: u64 },
    /// Stopped early; the partial file is flushed and resumable
    Aborted {
        bytes_written: u64,
        reason: AbortReason,
    },
}

/// Moves bytes from a remote resource into a local file
///
/// Implementations append to an existing partial file, report cumulative
/// bytes through the progress reporter and stop between chunks when the
/// abort signal is raised.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
        abort: AbortSignal,
    ) -> Result<TransferOutcome>;
}

/// Persistent download state for resume support
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeState {
    /// Resource URL without query parameters
    pub source: String,

    /// Total content length in bytes, when the server announced one
    pub content_length: Option<u64>,

    /// Bytes written and flushed to disk
    pub write_position: u64,

    /// Timestamp of last save
    pub timestamp: String,
}

impl ResumeState {
    pub fn new(url: &str) -> Self {
        Self {
            source: redact_url(url),
            content_length: None,
            write_position: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Load the sidecar next to a download, if there is a readable one
    pub async fn load(destination: &Path) -> Option<Self> {
        let path = resume_state_path(destination);
        let json = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable resume state");
                None
            }
        }
    }

    pub async fn save(&mut self, destination: &Path) -> Result<()> {
        self.timestamp = chrono::Utc::now().to_rfc3339();
        let json = serde_json::to_string_pretty(self)?;
        let path = resume_state_path(destination);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| OfflineError::file_io("Failed to write resume state", &path, e))
    }

    pub async fn delete(destination: &Path) -> Result<()> {
        remove_file_if_exists(&resume_state_path(destination)).await?;
        Ok(())
    }
}

/// Outcome of a single HTTP attempt
enum Attempt {
    Done(u64),
    Aborted(u64, AbortReason),
    /// Partial file no longer matches the remote resource
    Restart,
}

/// Resumable HTTP transfer executor
pub struct HttpTransfer {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
    idle_timeout: Duration,
}

impl HttpTransfer {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        // Only connecting is bounded; long bodies are policed by the idle timeout
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self::with_client(client, config.max_retries)
            .with_idle_timeout(config.idle_timeout()))
    }

    pub fn with_client(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
            retry_delay: Duration::from_secs(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Longest silence tolerated while waiting for headers or body bytes
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Base delay of the exponential retry backoff
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn stalled(&self) -> OfflineError {
        OfflineError::network_error(
            format!("no data received for {:?}", self.idle_timeout),
            true,
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(10));
        self.retry_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    async fn attempt(
        &self,
        request: &TransferRequest,
        state: &mut ResumeState,
        progress: &mut ProgressReporter,
        abort: &mut AbortSignal,
    ) -> Result<Attempt> {
        let destination = &request.destination;
        let position = file_size_or_zero(destination).await;
        progress.report(position);

        let mut builder = self.client.get(&request.url);
        for (key, value) in &request.headers {
            if !key.eq_ignore_ascii_case("range") {
                builder = builder.header(key, value);
            }
        }
        if position > 0 {
            builder = builder.header("Range", format!("bytes={}-", position));
        }

        let response = tokio::select! {
            biased;
            reason = abort.aborted() => return Ok(Attempt::Aborted(position, reason)),
            response = tokio::time::timeout(self.idle_timeout, builder.send()) => match response {
                Ok(response) => response?,
                Err(_) => return Err(self.stalled()),
            },
        };

        let status = response.status();
        let (start, total) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let header = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        OfflineError::MalformedRangeResponse("206 without Content-Range".to_string())
                    })?;
                let (start, total) = parse_content_range(header)?;

                if start != position {
                    return Err(OfflineError::MalformedRangeResponse(format!(
                        "requested bytes from {}, server sent from {}",
                        position, start
                    )));
                }
                if let (Some(known), Some(total)) = (state.content_length, total) {
                    if known != total {
                        warn!(known, total, "remote size changed, restarting download");
                        return Ok(Attempt::Restart);
                    }
                }
                (start, total.or(state.content_length))
            }
            StatusCode::OK => {
                if position > 0 {
                    debug!(position, "server ignored range request, restarting from zero");
                }
                (0, response.content_length())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                if position > 0 && state.content_length == Some(position) {
                    return Ok(Attempt::Done(position));
                }
                return Ok(Attempt::Restart);
            }
            _ => {
                return Err(OfflineError::TransferFailed {
                    status: status.as_u16(),
                    url: redact_url(&request.url),
                })
            }
        };

        // 200 rewrites the file; 206 appends to it
        let file = if start == 0 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(destination)
                .await
        } else {
            OpenOptions::new().create(true).append(true).open(destination).await
        }
        .map_err(|e| OfflineError::file_io("Failed to open", destination, e))?;

        state.content_length = total;
        state.write_position = start;
        state.save(destination).await?;

        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
        let mut stream = response.bytes_stream();
        let mut written = start;
        let mut since_flush = 0u64;

        loop {
            tokio::select! {
                biased;
                reason = abort.aborted() => {
                    writer.flush().await?;
                    state.write_position = written;
                    state.save(destination).await?;
                    return Ok(Attempt::Aborted(written, reason));
                }
                chunk = tokio::time::timeout(self.idle_timeout, stream.next()) => match chunk {
                    Ok(Some(Ok(bytes))) => {
                        writer.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        since_flush += bytes.len() as u64;

                        if since_flush >= DATA_FLUSH_SZ {
                            writer.flush().await?;
                            state.write_position = written;
                            since_flush = 0;
                        }
                        progress.report(written);
                    }
                    Ok(Some(Err(e))) => {
                        writer.flush().await?;
                        state.write_position = written;
                        state.save(destination).await?;
                        return Err(e.into());
                    }
                    Ok(None) => break,
                    Err(_) => {
                        writer.flush().await?;
                        state.write_position = written;
                        state.save(destination).await?;
                        debug!(written, "response body stalled");
                        return Err(self.stalled());
                    }
                }
            }
        }

        writer.flush().await?;
        state.write_position = written;

        if let Some(expected) = total {
            if written < expected {
                state.save(destination).await?;
                return Err(OfflineError::IncompleteTransfer {
                    expected,
                    actual: written,
                });
            }
        }

        Ok(Attempt::Done(written))
    }
}

#[async_trait]
impl TransferExecutor for HttpTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        mut progress: ProgressReporter,
        mut abort: AbortSignal,
    ) -> Result<TransferOutcome> {
        let destination = request.destination.clone();
        if let Some(parent) = destination.parent() {
            ensure_directory_exists(parent).await?;
        }

        let mut state = ResumeState::load(&destination)
            .await
            .unwrap_or_else(|| ResumeState::new(&request.url));
        let mut retries = 0u32;
        let mut restarts = 0u32;

        loop {
            match self
                .attempt(&request, &mut state, &mut progress, &mut abort)
                .await
            {
                Ok(Attempt::Done(bytes_written)) => {
                    ResumeState::delete(&destination).await?;
                    progress.finish();
                    return Ok(TransferOutcome::Completed { bytes_written });
                }
                Ok(Attempt::Aborted(bytes_written, reason)) => {
                    progress.finish();
                    return Ok(TransferOutcome::Aborted {
                        bytes_written,
                        reason,
                    });
                }
                Ok(Attempt::Restart) if restarts < MAX_RESTARTS => {
                    restarts += 1;
                    remove_file_if_exists(&destination).await?;
                    ResumeState::delete(&destination).await?;
                    state = ResumeState::new(&request.url);
                }
                Ok(Attempt::Restart) => {
                    return Err(OfflineError::MalformedRangeResponse(
                        "partial file does not match the remote resource".to_string(),
                    ));
                }
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transfer attempt failed, retrying"
                    );

                    tokio::select! {
                        reason = abort.aborted() => {
                            return Ok(TransferOutcome::Aborted {
                                bytes_written: file_size_or_zero(&destination).await,
                                reason,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse `bytes <start>-<end>/<total>`; total may be `*`
pub fn parse_content_range(value: &str) -> Result<(u64, Option<u64>)> {
    let malformed = || OfflineError::MalformedRangeResponse(format!("Content-Range '{}'", value));

    let rest = value.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
    let (range, total) = rest.split_once('/').ok_or_else(malformed)?;
    let (start, _end) = range.split_once('-').ok_or_else(malformed)?;

    let start = start.trim().parse::<u64>().map_err(|_| malformed())?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };

    Ok((start, total))
}

/// Drop the query string; download URLs carry access tokens
pub fn redact_url(url: &str) -> String {
    url.split('?').next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 3000000-9999999/10000000").unwrap(),
            (3_000_000, Some(10_000_000))
        );
        assert_eq!(parse_content_range("bytes 5-9/*").unwrap(), (5, None));
        assert!(parse_content_range("items 0-1/2").is_err());
        assert!(parse_content_range("bytes x-1/2").is_err());
    }

    #[test]
    fn test_redact_url_strips_query() {
        assert_eq!(
            redact_url("https://media.local/Items/1/Download?api_key=secret"),
            "https://media.local/Items/1/Download"
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let transfer = HttpTransfer::with_client(Client::new(), 3)
            .with_retry_delay(Duration::from_millis(100));
        assert_eq!(transfer.backoff(1), Duration::from_millis(100));
        assert_eq!(transfer.backoff(3), Duration::from_millis(400));
        assert_eq!(transfer.backoff(40), MAX_BACKOFF);
    }

    #[test]
    fn test_stall_is_retryable() {
        let transfer = HttpTransfer::with_client(Client::new(), 1)
            .with_idle_timeout(Duration::from_millis(250));
        let err = transfer.stalled();
        assert!(err.is_retryable());
        assert!(err.is_transfer_error());
        assert!(err.to_string().contains("250ms"));
    }

    #[tokio::test]
    async fn test_abort_signal() {
        let (handle, mut signal) = AbortSignal::new();
        assert!(!signal.is_aborted());

        handle.abort(AbortReason::Pause);
        assert_eq!(signal.aborted().await, AbortReason::Pause);
        assert_eq!(signal.reason(), Some(AbortReason::Pause));
        assert!(!AbortSignal::never().is_aborted());
    }

    #[tokio::test]
    async fn test_resume_state_sidecar() {
        let temp_dir = tempfile::tempdir().unwrap();
        let destination = temp_dir.path().join("item.mp4");

        assert!(ResumeState::load(&destination).await.is_none());

        let mut state = ResumeState::new("https://media.local/Videos/1/stream?api_key=t");
        state.content_length = Some(42);
        state.save(&destination).await.unwrap();

        let loaded = ResumeState::load(&destination).await.unwrap();
        assert_eq!(loaded.content_length, Some(42));
        assert!(!loaded.source.contains("api_key"));

        ResumeState::delete(&destination).await.unwrap();
        assert!(ResumeState::load(&destination).await.is_none());
    }
}
