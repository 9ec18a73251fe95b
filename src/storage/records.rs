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


//! Download record store
//!
//! Durable, observable collection of [`DownloadTask`]s. Status changes are
//! compare-and-set updates (`WHERE status = <old>`), so two transitions for
//! the same task can never both apply. Every mutation is published on a
//! broadcast channel for UI observers.

use crate::download::task::{DownloadStatus, DownloadTask, MediaItem, MediaKind, TaskEvent};
use crate::error::{OfflineError, Result};
use crate::storage::Database;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Buffered events per subscriber before old ones are dropped
const EVENT_CAPACITY: usize = 256;

/// Attempts at a compare-and-set transition before giving up
const MAX_CAS_ATTEMPTS: usize = 3;

/// Change notification published by the store
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// Task inserted or mutated; carries the new snapshot
    Updated(DownloadTask),
    /// Task row deleted
    Removed { task_id: String, item_id: String },
    /// Every row deleted
    Cleared,
}

/// Field changes applied together with a status transition
enum TransitionFields<'a> {
    None,
    Complete { local_path: &'a str, bytes: u64 },
    Fail { message: &'a str },
}

/// SQLite-backed record store
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    events: broadcast::Sender<RecordEvent>,
}

impl RecordStore {
    pub fn new(db: &Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool: db.pool().clone(),
            events,
        }
    }

    /// Receive every subsequent mutation
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RecordEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Insert a new pending task for an item
    pub async fn insert_pending(
        &self,
        item: &MediaItem,
        server_id: &str,
        estimated_size_bytes: u64,
    ) -> Result<DownloadTask> {
        let task_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO DownloadTasks (
                task_id, item_id, server_id, title, media_kind, container,
                media_source_id, status, estimated_size_bytes, downloaded_bytes, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&task_id)
        .bind(&item.id)
        .bind(server_id)
        .bind(&item.name)
        .bind(item.kind.as_str())
        .bind(&item.container)
        .bind(&item.media_source_id)
        .bind(DownloadStatus::Pending.as_str())
        .bind(estimated_size_bytes as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let task = self.get(&task_id).await?;
        debug!(task_id = %task.id, item_id = %task.item_id, "task inserted");
        self.publish(RecordEvent::Updated(task.clone()));
        Ok(task)
    }

    /// Get a task by ID
    pub async fn get(&self, task_id: &str) -> Result<DownloadTask> {
        self.find(task_id)
            .await?
            .ok_or_else(|| OfflineError::task_not_found(task_id))
    }

    pub async fn find(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        let row = sqlx::query("SELECT * FROM DownloadTasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_task).transpose()
    }

    /// Most recent task for an item, whatever its status
    pub async fn find_by_item(&self, item_id: &str) -> Result<Option<DownloadTask>> {
        let row = sqlx::query(
            "SELECT * FROM DownloadTasks WHERE item_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    /// Completed task for an item
    pub async fn find_completed(&self, item_id: &str) -> Result<Option<DownloadTask>> {
        let row = sqlx::query(
            "SELECT * FROM DownloadTasks WHERE item_id = ? AND status = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(item_id)
        .bind(DownloadStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    /// Oldest pending task (FIFO by admission)
    pub async fn next_pending(&self) -> Result<Option<DownloadTask>> {
        let row = sqlx::query(
            "SELECT * FROM DownloadTasks WHERE status = ? ORDER BY seq ASC LIMIT 1",
        )
        .bind(DownloadStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    /// List tasks in admission order, optionally filtered by status
    pub async fn list(&self, filter: Option<DownloadStatus>) -> Result<Vec<DownloadTask>> {
        let rows = if let Some(status) = filter {
            sqlx::query("SELECT * FROM DownloadTasks WHERE status = ? ORDER BY seq ASC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM DownloadTasks ORDER BY seq ASC")
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(row_to_task).collect()
    }

    /// Apply a lifecycle event
    pub async fn apply(&self, task_id: &str, event: TaskEvent) -> Result<DownloadTask> {
        self.transition(task_id, event, TransitionFields::None).await
    }

    /// Downloading (or paused too late) -> Completed, reconciling sizes to
    /// the real byte count
    pub async fn complete(&self, task_id: &str, local_path: &str, bytes: u64) -> Result<DownloadTask> {
        self.transition(
            task_id,
            TaskEvent::Complete,
            TransitionFields::Complete { local_path, bytes },
        )
        .await
    }

    /// Downloading -> Failed with a displayable message
    pub async fn fail(&self, task_id: &str, message: &str) -> Result<DownloadTask> {
        self.transition(task_id, TaskEvent::Fail, TransitionFields::Fail { message })
            .await
    }

    async fn transition(
        &self,
        task_id: &str,
        event: TaskEvent,
        fields: TransitionFields<'_>,
    ) -> Result<DownloadTask> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(task_id).await?;
            let next = current.status.transition(event)?;

            let result = match fields {
                TransitionFields::None => {
                    // Re-entering the queue clears a previous failure
                    sqlx::query(
                        r#"
                        UPDATE DownloadTasks
                        SET status = ?,
                            error_message = CASE WHEN ? = 'pending' THEN NULL ELSE error_message END
                        WHERE task_id = ? AND status = ?
                        "#,
                    )
                    .bind(next.as_str())
                    .bind(next.as_str())
                    .bind(task_id)
                    .bind(current.status.as_str())
                    .execute(&self.pool)
                    .await?
                }
                TransitionFields::Complete { local_path, bytes } => {
                    sqlx::query(
                        r#"
                        UPDATE DownloadTasks
                        SET status = ?, local_path = ?, downloaded_bytes = ?,
                            estimated_size_bytes = ?, error_message = NULL, completed_at = ?
                        WHERE task_id = ? AND status = ?
                        "#,
                    )
                    .bind(next.as_str())
                    .bind(local_path)
                    .bind(bytes as i64)
                    .bind(bytes as i64)
                    .bind(chrono::Utc::now().to_rfc3339())
                    .bind(task_id)
                    .bind(current.status.as_str())
                    .execute(&self.pool)
                    .await?
                }
                TransitionFields::Fail { message } => {
                    sqlx::query(
                        "UPDATE DownloadTasks SET status = ?, error_message = ? WHERE task_id = ? AND status = ?",
                    )
                    .bind(next.as_str())
                    .bind(message)
                    .bind(task_id)
                    .bind(current.status.as_str())
                    .execute(&self.pool)
                    .await?
                }
            };

            if result.rows_affected() == 1 {
                let task = self.get(task_id).await?;
                debug!(task_id, from = %current.status, to = %task.status, "task transition");
                self.publish(RecordEvent::Updated(task.clone()));
                return Ok(task);
            }
        }

        Err(OfflineError::internal(format!(
            "Task {} kept changing while applying '{}'",
            task_id, event
        )))
    }

    /// Record progress of a downloading task
    ///
    /// Ignored unless the task is downloading; never moves the counter
    /// backwards. Returns whether the row was updated.
    pub async fn update_progress(&self, task_id: &str, bytes: u64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE DownloadTasks
            SET downloaded_bytes = MAX(downloaded_bytes, ?)
            WHERE task_id = ? AND status = ?
            "#,
        )
        .bind(bytes as i64)
        .bind(task_id)
        .bind(DownloadStatus::Downloading.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if let Some(task) = self.find(task_id).await? {
            self.publish(RecordEvent::Updated(task));
        }
        Ok(true)
    }

    /// Delete a task; returns the removed record if it existed
    pub async fn remove(&self, task_id: &str) -> Result<Option<DownloadTask>> {
        let Some(task) = self.find(task_id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM DownloadTasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        self.publish(RecordEvent::Removed {
            task_id: task.id.clone(),
            item_id: task.item_id.clone(),
        });
        Ok(Some(task))
    }

    /// Delete every task; returns how many were removed
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM DownloadTasks")
            .execute(&self.pool)
            .await?;
        self.publish(RecordEvent::Cleared);
        Ok(result.rows_affected())
    }

    /// Sum of downloaded bytes across all tracked records
    pub async fn used_storage(&self) -> Result<u64> {
        let used: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(downloaded_bytes), 0) FROM DownloadTasks")
                .fetch_one(&self.pool)
                .await?;
        Ok(used.max(0) as u64)
    }
}

/// Convert database row to DownloadTask
fn row_to_task(row: SqliteRow) -> Result<DownloadTask> {
    let status: String = row.try_get("status")?;
    let media_kind: String = row.try_get("media_kind")?;

    Ok(DownloadTask {
        id: row.try_get("task_id")?,
        item_id: row.try_get("item_id")?,
        server_id: row.try_get("server_id")?,
        title: row.try_get("title")?,
        media_kind: MediaKind::from_str(&media_kind)?,
        container: row.try_get("container")?,
        media_source_id: row.try_get("media_source_id")?,
        status: DownloadStatus::from_str(&status)?,
        estimated_size_bytes: row.try_get::<i64, _>("estimated_size_bytes")?.max(0) as u64,
        downloaded_bytes: row.try_get::<i64, _>("downloaded_bytes")?.max(0) as u64,
        local_path: row.try_get("local_path")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
