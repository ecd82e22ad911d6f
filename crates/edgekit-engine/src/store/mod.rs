// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of application records.
//!
//! The registry is authoritative while the engine runs. A store only has to
//! give the records back after a restart.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::ApplicationRecord;

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migrations could not be applied.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored record could not be encoded or decoded.
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage for [`ApplicationRecord`]s.
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Insert or replace a record.
    async fn save(&self, record: &ApplicationRecord) -> Result<()>;

    /// Delete a record. Deleting an unknown id is not an error.
    async fn delete(&self, canonical_id: &str) -> Result<()>;

    /// Every stored record.
    async fn load_all(&self) -> Result<Vec<ApplicationRecord>>;

    async fn health_check(&self) -> Result<bool>;
}
