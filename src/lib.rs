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


//! Offline content pipeline for mobile media clients
//!
//! Downloads media from a Jellyfin-compatible server into a local library
//! and optionally keeps the files encrypted at rest.
//!
//! # Layout
//! - [`download`]: task model, queue, transfer executor, progress
//! - [`storage`]: SQLite record store
//! - [`crypto`]: key store, stream codec, decrypted cache
//! - [`file`]: content paths and filesystem helpers
//! - [`session`]: collaborators supplied by the host app
//!
//! # Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use media_offline_core::config::PipelineConfig;
//! use media_offline_core::download::{DownloadManager, MediaItem, MediaKind};
//! use media_offline_core::session::{ServerContext, StaticSessions};
//! use media_offline_core::storage::{Database, RecordStore};
//!
//! # async fn example() -> media_offline_core::Result<()> {
//! let config = PipelineConfig::for_root("/tmp/media-offline");
//! let db = Database::new(&config.database_path).await?;
//! let sessions = StaticSessions::new().with_server(ServerContext {
//!     server_id: "home".into(),
//!     base_url: "https://media.example.com".into(),
//!     access_token: "token".into(),
//!     user_id: None,
//! });
//!
//! let manager = DownloadManager::builder(config, RecordStore::new(&db), Arc::new(sessions)).build()?;
//! let item = MediaItem::new("f00d", "Episode 1", MediaKind::Video);
//! let task_id = manager.start_download(&item, "home").await?;
//! manager.wait_for_idle().await;
//! println!("{:?}", manager.get_task(&task_id).await?.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod file;
pub mod session;
pub mod storage;

pub use config::PipelineConfig;
pub use error::{OfflineError, Result};
