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


//! Download management and streaming
//!
//! This module moves media from the server into the local library.
//!
//! - [`task`]: task model and lifecycle state machine
//! - [`transfer`]: resumable HTTP transfer executor
//! - [`progress`]: throttled progress reporting and display snapshots
//! - [`manager`]: queue, dedup, pause/resume/cancel, storage accounting

pub mod manager;
pub mod progress;
pub mod task;
pub mod transfer;

// Re-export commonly used types
pub use manager::{DownloadManager, DownloadManagerBuilder, StorageInfo};
pub use progress::{DownloadProgress, ProgressReporter, SpeedTracker};
pub use task::{DownloadStatus, DownloadTask, MediaItem, MediaKind, TaskEvent};
pub use transfer::{
    AbortReason, AbortSignal, HttpTransfer, TransferExecutor, TransferOutcome, TransferRequest,
};
