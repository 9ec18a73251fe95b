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


//! Database migrations
//!
//! # Migration Strategy
//! Since sqlx's compile-time migration system requires build-time database connection,
//! we implement migrations as runtime SQL execution for mobile compatibility.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};

/// Run all database migrations
///
/// Migrations are tracked in the `_migrations` table.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    run_migration(pool, 1, "download_tasks", create_download_tasks(pool)).await?;

    Ok(())
}

/// Create migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    Ok(())
}

/// Run a single migration if it hasn't been applied yet
async fn run_migration(
    pool: &SqlitePool,
    id: i32,
    name: &str,
    migration_fn: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let applied: Option<i32> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    if applied.is_some() {
        return Ok(());
    }

    migration_fn.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Download records
///
/// `seq` gives FIFO admission order. The partial unique index keeps at most
/// one claiming task (pending, downloading, paused) per item.
async fn create_download_tasks(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
CREATE TABLE IF NOT EXISTS DownloadTasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    item_id TEXT NOT NULL,
    server_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    media_kind TEXT NOT NULL,
    container TEXT,
    media_source_id TEXT,
    status TEXT NOT NULL,
    estimated_size_bytes INTEGER NOT NULL DEFAULT 0,
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
    local_path TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_download_tasks_item ON DownloadTasks(item_id);
CREATE INDEX IF NOT EXISTS idx_download_tasks_status ON DownloadTasks(status, seq);

CREATE UNIQUE INDEX IF NOT EXISTS idx_download_tasks_claim
    ON DownloadTasks(item_id)
    WHERE status IN ('pending', 'downloading', 'paused');
        "#,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        run_migrations(db.pool()).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_claim_index_rejects_second_active_task() {
        let db = Database::new_in_memory().await.unwrap();
        let insert = "INSERT INTO DownloadTasks (task_id, item_id, server_id, media_kind, status, created_at) \
                      VALUES (?, 'item', 'srv', 'video', ?, '2025-01-01T00:00:00Z')";

        sqlx::query(insert).bind("t1").bind("completed").execute(db.pool()).await.unwrap();
        sqlx::query(insert).bind("t2").bind("pending").execute(db.pool()).await.unwrap();
        let dup = sqlx::query(insert).bind("t3").bind("paused").execute(db.pool()).await;
        assert!(dup.is_err());
    }
}
