// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backend trait definitions.
//!
//! Defines the abstract interface for the substrate that actually runs
//! application code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgekit_protocol::message::{AppKind, StreamTag};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The application payload cannot be executed as declared.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Process or container failed to start.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// The execution is not known to the backend (already gone).
    #[error("Execution not running: {0}")]
    NotRunning(String),

    /// Pause, resume or terminate could not be delivered.
    #[error("Signal failed: {0}")]
    Signal(String),

    /// The backend did not acknowledge in time.
    #[error("Backend timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Everything the backend needs to start one execution.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Fresh id for this run attempt.
    pub execution_id: String,
    /// Canonical application id.
    pub app_id: String,
    pub app_kind: AppKind,
    /// Kind-specific payload, opaque to the engine.
    pub payload: Value,
    /// Declared dependencies, opaque to the engine.
    pub dependencies: Vec<Value>,
}

/// Reference to a live execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub execution_id: String,
    /// Backend-specific id (PID, container name, mock key)
    pub handle_id: String,
    pub started_at: DateTime<Utc>,
    /// PID of the spawned process, when there is one.
    pub pid: Option<u32>,
}

/// Asynchronous notifications from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A chunk of output was produced.
    Output {
        execution_id: String,
        stream: StreamTag,
        bytes: Vec<u8>,
    },
    /// The execution is no longer running. Sent after all of its output.
    Terminated {
        execution_id: String,
        /// Exit code; signals are reported as `128 + signo`. `None` when
        /// the backend could not determine it.
        exit_code: Option<i32>,
    },
}

/// Channel the backend pushes [`BackendEvent`]s into.
pub type EventSender = mpsc::Sender<BackendEvent>;

/// Trait for execution backends.
///
/// The backend is the only component that talks to the process or
/// container runtime. It unifies interpreted, binary and image payloads
/// behind one lifecycle.
///
/// Backends never touch engine state. Every state change they cause is
/// reported through the event channel handed to [`launch`](Self::launch).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend type identifier (e.g., "process", "mock")
    fn backend_type(&self) -> &'static str;

    /// Start an execution.
    ///
    /// Must return only once the process is verifiably scheduled. Output
    /// and the final termination are sent to `events`.
    async fn launch(&self, spec: &LaunchSpec, events: EventSender) -> Result<ExecutionHandle>;

    /// Suspend a running execution.
    async fn pause(&self, handle: &ExecutionHandle) -> Result<()>;

    /// Continue a suspended execution.
    async fn resume(&self, handle: &ExecutionHandle) -> Result<()>;

    /// Stop an execution.
    ///
    /// Must return only once the process is verifiably no longer running.
    async fn terminate(&self, handle: &ExecutionHandle) -> Result<()>;

    /// Write bytes to the execution's standard input.
    async fn write_input(&self, handle: &ExecutionHandle, bytes: &[u8]) -> Result<()>;

    /// Release anything kept for an application that is being removed.
    async fn discard(&self, app_id: &str) -> Result<()> {
        let _ = app_id;
        Ok(())
    }
}
