// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Each record is kept as one JSON document next to the columns needed to
//! inspect the table by hand.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use super::{AppStore, Result};
use crate::registry::ApplicationRecord;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed application store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and create if needed) the database at `path`, then migrate it.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Open a database from a `sqlite:` URL or a plain file path.
    pub async fn open(url_or_path: &str) -> Result<Self> {
        if url_or_path.starts_with("sqlite:") {
            Self::connect(url_or_path).await
        } else {
            Self::from_path(url_or_path).await
        }
    }

    async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!(url = %url, "SQLite application store ready");

        Ok(Self { pool })
    }
}

#[async_trait]
impl AppStore for SqliteStore {
    async fn save(&self, record: &ApplicationRecord) -> Result<()> {
        let document = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO applications (canonical_id, record, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (canonical_id) DO UPDATE
            SET record = excluded.record,
                state = excluded.state,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&record.canonical_id)
        .bind(document)
        .bind(record.state.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, canonical_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM applications
            WHERE canonical_id = ?
            "#,
        )
        .bind(canonical_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ApplicationRecord>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT canonical_id, record
            FROM applications
            ORDER BY created_at, canonical_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (canonical_id, document) in rows {
            match serde_json::from_str::<ApplicationRecord>(&document) {
                Ok(record) => records.push(record),
                // One corrupt row must not keep every other application down.
                Err(e) => warn!(
                    app_id = %canonical_id,
                    error = %e,
                    "Skipping unreadable application record"
                ),
            }
        }
        Ok(records)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
