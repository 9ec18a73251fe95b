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


//! Download progress tracking and reporting
//!
//! # Progress Information
//! - [`ProgressReporter`]: executor side, throttled and monotonic byte counter
//! - [`SpeedTracker`]: moving-average speed over a time window
//! - [`DownloadProgress`]: display snapshot (percent, speed, ETA) of a task

use crate::download::task::{DownloadStatus, DownloadTask};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Executor-side progress handle
///
/// Reports are forwarded at most once per interval and never go backwards.
/// The latest value is always delivered when the reporter is finished or
/// dropped, so the final byte count is never lost to throttling.
#[derive(Debug)]
pub struct ProgressReporter {
    sender: watch::Sender<u64>,
    interval: Duration,
    last_emit: Option<Instant>,
    latest: u64,
}

impl ProgressReporter {
    /// Create a reporter and the receiver the manager drains
    pub fn channel(interval: Duration) -> (Self, watch::Receiver<u64>) {
        let (sender, receiver) = watch::channel(0);
        let reporter = Self {
            sender,
            interval,
            last_emit: None,
            latest: 0,
        };
        (reporter, receiver)
    }

    /// Record the cumulative number of bytes on disk
    pub fn report(&mut self, bytes: u64) {
        if bytes <= self.latest {
            return;
        }
        self.latest = bytes;

        let now = Instant::now();
        let due = self
            .last_emit
            .map(|last| now.duration_since(last) >= self.interval)
            .unwrap_or(true);

        if due {
            self.last_emit = Some(now);
            self.emit();
        }
    }

    /// Deliver the latest value regardless of the throttle
    pub fn finish(&mut self) {
        self.last_emit = Some(Instant::now());
        self.emit();
    }

    /// Highest value reported so far
    pub fn latest(&self) -> u64 {
        self.latest
    }

    fn emit(&self) {
        let latest = self.latest;
        self.sender.send_if_modified(|current| {
            if latest > *current {
                *current = latest;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.emit();
    }
}

/// Speed tracker with moving average
///
/// Uses a sliding window to smooth out network fluctuations
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes downloaded so far)
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        // Remove samples outside the window
        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }

    /// Forget all samples (used when a task restarts from zero)
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress snapshot for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub task_id: String,
    pub title: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// Estimated total; becomes exact once the task completes
    pub total_bytes: u64,
    /// Percentage complete (0.0 - 100.0)
    pub percent_complete: f64,
    /// Bytes per second
    pub download_speed: f64,
    /// Estimated time remaining in seconds (0 if unknown)
    pub eta_seconds: u64,
    pub error_message: Option<String>,
}

impl DownloadProgress {
    /// Build a snapshot from a task record and a measured speed
    pub fn from_task(task: &DownloadTask, download_speed: f64) -> Self {
        let mut progress = Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            bytes_downloaded: task.downloaded_bytes,
            total_bytes: task.estimated_size_bytes,
            percent_complete: 0.0,
            download_speed,
            eta_seconds: 0,
            error_message: task.error_message.clone(),
        };
        progress.calculate_percentage();
        progress.calculate_eta();
        progress
    }

    fn calculate_percentage(&mut self) {
        self.percent_complete = if self.total_bytes > 0 {
            (self.bytes_downloaded as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    fn calculate_eta(&mut self) {
        self.eta_seconds = if self.download_speed > 0.0 && self.total_bytes > 0 {
            let remaining = self.total_bytes.saturating_sub(self.bytes_downloaded);
            (remaining as f64 / self.download_speed) as u64
        } else {
            0
        };
    }

    /// Format download speed, e.g. "2.5 MB/s"
    pub fn speed_string(&self) -> String {
        format!("{:.1} MB/s", self.download_speed / 1_000_000.0)
    }

    /// Format ETA, e.g. "5m 30s"
    pub fn eta_string(&self) -> String {
        if self.eta_seconds == 0 {
            return "calculating...".to_string();
        }

        let hours = self.eta_seconds / 3600;
        let minutes = (self.eta_seconds % 3600) / 60;
        let seconds = self.eta_seconds % 60;

        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Format bytes, e.g. "45.2 MB"
    pub fn bytes_string(bytes: u64) -> String {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    }

    pub fn display_string(&self) -> String {
        match self.status {
            DownloadStatus::Pending => format!("{}: Queued", self.title),
            DownloadStatus::Downloading => format!(
                "{}: {:.1}% ({} / {}) - {} - {}",
                self.title,
                self.percent_complete,
                Self::bytes_string(self.bytes_downloaded),
                Self::bytes_string(self.total_bytes),
                self.speed_string(),
                self.eta_string()
            ),
            DownloadStatus::Paused => {
                format!("{}: Paused at {:.1}%", self.title, self.percent_complete)
            }
            DownloadStatus::Completed => format!("{}: Completed", self.title),
            DownloadStatus::Failed => format!(
                "{}: Failed - {}",
                self.title,
                self.error_message.as_deref().unwrap_or("Unknown error")
            ),
        }
    }
}
