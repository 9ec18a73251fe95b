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


//! Download task model and lifecycle state machine
//!
//! ```text
//! (none) --start_download--> Pending
//! Pending --Start--> Downloading
//! Downloading --Complete--> Completed
//! Paused --Complete--> Completed         (pause landed after the last byte)
//! Downloading --Fail--> Failed
//! Downloading|Pending --Pause--> Paused
//! Paused --Resume--> Pending
//! Failed --Retry--> Pending
//! Downloading --Interrupt--> Pending      (process died mid-transfer)
//! any --cancel/delete--> (none)           (row removed)
//! ```
//!
//! Every status change in the record store goes through
//! [`DownloadStatus::transition`].

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest container name accepted as a file extension
const MAX_EXTENSION_LEN: usize = 8;

/// Kind of content; decides endpoint shape and file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Book,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Book => "book",
            MediaKind::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "book" => Ok(MediaKind::Book),
            "video" => Ok(MediaKind::Video),
            _ => Err(OfflineError::internal(format!("Invalid media kind: {}", s))),
        }
    }

    /// Map a server item type ("Audio", "AudioBook", "Book", "Movie", ...)
    pub fn from_item_type(item_type: &str) -> Self {
        match item_type {
            "Audio" | "AudioBook" => MediaKind::Audio,
            "Book" => MediaKind::Book,
            _ => MediaKind::Video,
        }
    }
}

/// Content descriptor handed in by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    pub kind: MediaKind,
    /// Container reported by the server (books only: "epub", "pdf", "cbz")
    #[serde(default)]
    pub container: Option<String>,
    /// Best-known size in bytes
    #[serde(default)]
    pub size_hint: Option<u64>,
    #[serde(default)]
    pub media_source_id: Option<String>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            container: None,
            size_hint: None,
            media_source_id: None,
        }
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Extension of the stored file
    ///
    /// A book container is only used when it is plain `[a-z0-9]`; anything
    /// else falls back to `epub`.
    pub fn extension(&self) -> String {
        match self.kind {
            MediaKind::Audio => "mp3".to_string(),
            MediaKind::Book => self
                .container
                .as_deref()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| {
                    !c.is_empty()
                        && c.len() <= MAX_EXTENSION_LEN
                        && c.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                })
                .unwrap_or_else(|| "epub".to_string()),
            MediaKind::Video => "mp4".to_string(),
        }
    }
}

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

/// Inputs of the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Queue picked the task up
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Retry,
    /// Task was downloading when the process stopped
    Interrupt,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskEvent::Start => "start",
            TaskEvent::Pause => "pause",
            TaskEvent::Resume => "resume",
            TaskEvent::Complete => "complete",
            TaskEvent::Fail => "fail",
            TaskEvent::Retry => "retry",
            TaskEvent::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "paused" => Ok(DownloadStatus::Paused),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            _ => Err(OfflineError::internal(format!("Invalid task status: {}", s))),
        }
    }

    /// The single place lifecycle transitions are decided
    pub fn transition(self, event: TaskEvent) -> Result<DownloadStatus> {
        use DownloadStatus::*;
        use TaskEvent::*;

        let next = match (self, event) {
            (Pending, Start) => Downloading,
            (Downloading, Complete) | (Paused, Complete) => Completed,
            (Downloading, Fail) => Failed,
            (Downloading, Pause) | (Pending, Pause) => Paused,
            (Paused, Resume) => Pending,
            (Failed, Retry) => Pending,
            (Downloading, Interrupt) => Pending,
            (from, event) => {
                return Err(OfflineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.to_string(),
                })
            }
        };

        Ok(next)
    }

    /// Pending, downloading or paused: the item is claimed by this task
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked download request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub item_id: String,
    pub server_id: String,
    pub title: String,
    pub media_kind: MediaKind,
    /// Container of the source item (books)
    pub container: Option<String>,
    pub media_source_id: Option<String>,
    pub status: DownloadStatus,
    pub estimated_size_bytes: u64,
    pub downloaded_bytes: u64,
    pub local_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl DownloadTask {
    /// Percentage complete (0 - 100), rounded
    pub fn progress_percent(&self) -> u8 {
        if self.estimated_size_bytes == 0 {
            return 0;
        }
        let percent = self.downloaded_bytes as f64 / self.estimated_size_bytes as f64 * 100.0;
        percent.round().min(100.0) as u8
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Rebuild the item this task was admitted for
    pub fn media_item(&self) -> MediaItem {
        MediaItem {
            id: self.item_id.clone(),
            name: self.title.clone(),
            kind: self.media_kind,
            container: self.container.clone(),
            size_hint: Some(self.estimated_size_bytes),
            media_source_id: self.media_source_id.clone(),
        }
    }

    /// Local file holds ciphertext
    pub fn is_encrypted(&self) -> bool {
        self.local_path
            .as_deref()
            .map(|p| crate::file::paths::is_encrypted_path(std::path::Path::new(p)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(
            DownloadStatus::Pending.transition(TaskEvent::Start).unwrap(),
            DownloadStatus::Downloading
        );
        assert_eq!(
            DownloadStatus::Downloading.transition(TaskEvent::Pause).unwrap(),
            DownloadStatus::Paused
        );
        assert_eq!(
            DownloadStatus::Paused.transition(TaskEvent::Resume).unwrap(),
            DownloadStatus::Pending
        );
        assert_eq!(
            DownloadStatus::Downloading.transition(TaskEvent::Complete).unwrap(),
            DownloadStatus::Completed
        );
        assert_eq!(
            DownloadStatus::Paused.transition(TaskEvent::Complete).unwrap(),
            DownloadStatus::Completed
        );
        assert_eq!(
            DownloadStatus::Failed.transition(TaskEvent::Retry).unwrap(),
            DownloadStatus::Pending
        );
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let err = DownloadStatus::Completed
            .transition(TaskEvent::Start)
            .unwrap_err();
        assert!(matches!(err, OfflineError::InvalidTransition { .. }));
        assert!(DownloadStatus::Pending.transition(TaskEvent::Complete).is_err());
        assert!(DownloadStatus::Pending.transition(TaskEvent::Resume).is_err());
        assert!(DownloadStatus::Completed.transition(TaskEvent::Pause).is_err());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
        ] {
            assert_eq!(DownloadStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(DownloadStatus::from_str("removed").is_err());
    }

    #[test]
    fn test_extension_by_kind() {
        assert_eq!(MediaItem::new("1", "a", MediaKind::Audio).extension(), "mp3");
        assert_eq!(MediaItem::new("1", "a", MediaKind::Video).extension(), "mp4");
        assert_eq!(MediaItem::new("1", "a", MediaKind::Book).extension(), "epub");
        assert_eq!(
            MediaItem::new("1", "a", MediaKind::Book)
                .with_container("PDF")
                .extension(),
            "pdf"
        );
        for container in ["epub/../../../escaped", "..", "e p", "cbz\0", "averylongcontainer"] {
            assert_eq!(
                MediaItem::new("1", "a", MediaKind::Book)
                    .with_container(container)
                    .extension(),
                "epub"
            );
        }
        assert_eq!(MediaKind::from_item_type("AudioBook"), MediaKind::Audio);
        assert_eq!(MediaKind::from_item_type("Episode"), MediaKind::Video);
    }
}
