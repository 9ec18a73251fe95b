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


//! Database storage for download records
//!
//! # Usage Example
//! ```no_run
//! use media_offline_core::download::task::{MediaItem, MediaKind};
//! use media_offline_core::storage::{Database, RecordStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./downloads.db").await?;
//! let store = RecordStore::new(&db);
//!
//! let item = MediaItem::new("f00d", "Episode 1", MediaKind::Video);
//! let task = store.insert_pending(&item, "home-server", 1_000_000).await?;
//! println!("queued {}", task.id);
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod migrations;
pub mod records;

// Re-export commonly used types
pub use database::Database;
pub use records::{RecordEvent, RecordStore};
