// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AppStore, Result, StoreError};
use crate::registry::ApplicationRecord;

/// Store that keeps records in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ApplicationRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with records, as if left behind by a previous run.
    pub fn with_records(records: impl IntoIterator<Item = ApplicationRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.canonical_id.clone(), r))
            .collect();
        Self {
            records: RwLock::new(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make `save` and `delete` fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn get(&self, canonical_id: &str) -> Option<ApplicationRecord> {
        self.records.read().await.get(canonical_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn save(&self, record: &ApplicationRecord) -> Result<()> {
        self.check_writable()?;
        self.records
            .write()
            .await
            .insert(record.canonical_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, canonical_id: &str) -> Result<()> {
        self.check_writable()?;
        self.records.write().await.remove(canonical_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ApplicationRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
