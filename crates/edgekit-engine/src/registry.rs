// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application registry.
//!
//! The authoritative in-memory map of canonical id to [`ApplicationRecord`].
//! Writers hold the application's operation lock; readers get cloned
//! snapshots that may be stale by the time they are used.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use edgekit_protocol::message::{AppKind, AppState, AppSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::ExecutionHandle;

/// One deployed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub canonical_id: String,
    pub display_name: String,
    pub app_kind: AppKind,
    pub state: AppState,
    /// Live execution. Never persisted: no process survives a restart.
    #[serde(skip)]
    pub execution: Option<ExecutionHandle>,
    /// Most recent execution, kept after it ends for output lookups.
    #[serde(default)]
    pub last_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Value>,
    #[serde(default)]
    pub signals: Vec<Value>,
    /// Kind-specific payload, read only by the backend.
    #[serde(default)]
    pub payload: Value,
}

impl ApplicationRecord {
    /// Wire view.
    pub fn summary(&self) -> AppSummary {
        AppSummary {
            app_id: self.canonical_id.clone(),
            display_name: self.display_name.clone(),
            app_kind: self.app_kind,
            state: self.state,
            execution_id: self.execution.as_ref().map(|h| h.execution_id.clone()),
            last_execution_id: self.last_execution_id.clone(),
            last_exit_code: self.last_exit_code,
            aliases: self.aliases.clone(),
            dependencies: self.dependencies.clone(),
            signals: self.signals.clone(),
            created_at: self.created_at,
            last_transition_at: self.last_transition_at,
        }
    }

    /// Id of the live execution, or the most recent one.
    pub fn current_or_last_execution(&self) -> Option<&str> {
        self.execution
            .as_ref()
            .map(|h| h.execution_id.as_str())
            .or(self.last_execution_id.as_deref())
    }
}

/// In-memory application records keyed by canonical id.
///
/// Every insert gets a fresh generation, so an id that is removed and
/// installed again is distinguishable from its predecessor.
#[derive(Debug, Default)]
pub struct Registry {
    apps: RwLock<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    record: ApplicationRecord,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.apps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.apps.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of one record.
    pub fn get(&self, canonical_id: &str) -> Option<ApplicationRecord> {
        self.read().get(canonical_id).map(|e| e.record.clone())
    }

    /// Generation of the record currently installed under `canonical_id`.
    pub fn generation(&self, canonical_id: &str) -> Option<u64> {
        self.read().get(canonical_id).map(|e| e.generation)
    }

    /// Snapshot of one record, only if it is still the given generation.
    pub fn get_generation(&self, canonical_id: &str, generation: u64) -> Option<ApplicationRecord> {
        self.read()
            .get(canonical_id)
            .filter(|e| e.generation == generation)
            .map(|e| e.record.clone())
    }

    /// Insert a record and return its generation.
    pub fn insert(&self, record: ApplicationRecord) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.write()
            .insert(record.canonical_id.clone(), Entry { generation, record });
        generation
    }

    /// Apply `f` to a record and return the updated snapshot.
    pub fn update<F>(&self, canonical_id: &str, f: F) -> Option<ApplicationRecord>
    where
        F: FnOnce(&mut ApplicationRecord),
    {
        let mut apps = self.write();
        let entry = apps.get_mut(canonical_id)?;
        f(&mut entry.record);
        Some(entry.record.clone())
    }

    pub fn remove(&self, canonical_id: &str) -> Option<ApplicationRecord> {
        self.write().remove(canonical_id).map(|e| e.record)
    }

    /// Snapshots ordered by creation time, optionally filtered by state.
    pub fn list(&self, state: Option<AppState>) -> Vec<ApplicationRecord> {
        let mut records: Vec<ApplicationRecord> = self
            .read()
            .values()
            .map(|e| &e.record)
            .filter(|r| state.is_none_or(|s| r.state == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.canonical_id.cmp(&b.canonical_id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of applications per state.
    pub fn count_by_state(&self) -> BTreeMap<AppState, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.read().values() {
            *counts.entry(entry.record.state).or_insert(0) += 1;
        }
        counts
    }

    /// Records currently holding an execution handle.
    pub fn with_execution(&self) -> Vec<ApplicationRecord> {
        self.read()
            .values()
            .map(|e| &e.record)
            .filter(|r| r.execution.is_some())
            .cloned()
            .collect()
    }
}
