// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution sessions: one entry per run attempt.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// One run attempt of an application. Immutable once closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSession {
    pub execution_id: String,
    /// Back-reference to the owning application.
    pub app_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl ExecutionSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Table of execution sessions.
#[derive(Debug, Default)]
pub struct Executions {
    sessions: RwLock<HashMap<String, ExecutionSession>>,
}

impl Executions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, execution_id: &str, app_id: &str) -> ExecutionSession {
        let session = ExecutionSession {
            execution_id: execution_id.to_string(),
            app_id: app_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.to_string(), session.clone());
        session
    }

    /// Close a session. Only the first close takes effect; returns whether
    /// this call closed it.
    pub fn close(&self, execution_id: &str, exit_code: Option<i32>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(execution_id) {
            Some(session) if session.is_active() => {
                session.ended_at = Some(Utc::now());
                session.exit_code = exit_code;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    /// Number of sessions not yet closed.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    /// Remove sessions closed more than `grace` ago, returning their ids.
    pub fn reap(&self, grace: Duration, now: DateTime<Utc>) -> Vec<String> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| {
                s.ended_at
                    .is_some_and(|ended| now.signed_duration_since(ended) >= grace)
            })
            .map(|s| s.execution_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    /// Remove every session of an application, returning their ids.
    pub fn remove_app(&self, app_id: &str) -> Vec<String> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = sessions
            .values()
            .filter(|s| s.app_id == app_id)
            .map(|s| s.execution_id.clone())
            .collect();
        for id in &ids {
            sessions.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
