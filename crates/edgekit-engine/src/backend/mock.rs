// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Simulates executions in memory. Tests drive output and exits through
//! [`MockBackend::emit_output`] and [`MockBackend::exit`].

use async_trait::async_trait;
use chrono::Utc;
use edgekit_protocol::message::StreamTag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;

/// Exit code reported when a mock execution is terminated.
pub const TERMINATED_EXIT_CODE: i32 = 143;

/// Mock execution state.
#[derive(Debug)]
struct MockExecution {
    app_id: String,
    events: EventSender,
    paused: bool,
    stdin: Vec<u8>,
}

/// Mock backend for testing.
pub struct MockBackend {
    executions: Mutex<HashMap<String, MockExecution>>,
    launches: AtomicUsize,
    discarded: Mutex<Vec<String>>,
    /// Delay before `launch` returns
    pub launch_delay: Duration,
    /// Delay before `terminate` returns
    pub terminate_delay: Duration,
    /// If set, launches fail
    fail_launch: AtomicBool,
    /// If set, pause/resume/terminate fail
    fail_signals: AtomicBool,
    /// If true, `launch` never returns (for backend timeout tests)
    pub hang_on_launch: bool,
    /// If set, every execution exits with this code right after launch
    pub exit_immediately: Option<i32>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            launches: AtomicUsize::new(0),
            discarded: Mutex::new(Vec::new()),
            launch_delay: Duration::from_millis(10),
            terminate_delay: Duration::ZERO,
            fail_launch: AtomicBool::new(false),
            fail_signals: AtomicBool::new(false),
            hang_on_launch: false,
            exit_immediately: None,
        }
    }

    /// Create a mock backend whose launches fail.
    pub fn failing() -> Self {
        let backend = Self::new();
        backend.fail_launch.store(true, Ordering::SeqCst);
        backend
    }

    /// Create a mock backend whose launches never complete.
    pub fn hanging() -> Self {
        Self {
            hang_on_launch: true,
            ..Self::new()
        }
    }

    /// Create a mock backend where every execution exits with `code` as
    /// soon as it has started.
    pub fn exiting_with(code: i32) -> Self {
        Self {
            exit_immediately: Some(code),
            ..Self::new()
        }
    }

    /// Set the launch delay.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Set the terminate delay.
    pub fn with_terminate_delay(mut self, delay: Duration) -> Self {
        self.terminate_delay = delay;
        self
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_signals(&self, fail: bool) {
        self.fail_signals.store(fail, Ordering::SeqCst);
    }

    /// Number of successful launches so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Ids of executions the backend considers live.
    pub async fn live_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live executions of one application.
    pub async fn executions_of(&self, app_id: &str) -> Vec<String> {
        self.executions
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.app_id == app_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn is_paused(&self, execution_id: &str) -> bool {
        self.executions
            .lock()
            .await
            .get(execution_id)
            .is_some_and(|e| e.paused)
    }

    /// Bytes written to an execution's stdin so far.
    pub async fn input_of(&self, execution_id: &str) -> Vec<u8> {
        self.executions
            .lock()
            .await
            .get(execution_id)
            .map(|e| e.stdin.clone())
            .unwrap_or_default()
    }

    /// Application ids passed to `discard`.
    pub async fn discarded(&self) -> Vec<String> {
        self.discarded.lock().await.clone()
    }

    /// Produce output for a live execution. Returns false if it is gone.
    pub async fn emit_output(&self, execution_id: &str, stream: StreamTag, bytes: &[u8]) -> bool {
        let events = match self.executions.lock().await.get(execution_id) {
            Some(e) => e.events.clone(),
            None => return false,
        };
        events
            .send(BackendEvent::Output {
                execution_id: execution_id.to_string(),
                stream,
                bytes: bytes.to_vec(),
            })
            .await
            .is_ok()
    }

    /// End a live execution with `exit_code`, as if the process exited.
    pub async fn exit(&self, execution_id: &str, exit_code: i32) -> bool {
        let Some(execution) = self.executions.lock().await.remove(execution_id) else {
            return false;
        };
        execution
            .events
            .send(BackendEvent::Terminated {
                execution_id: execution_id.to_string(),
                exit_code: Some(exit_code),
            })
            .await
            .is_ok()
    }

    fn check_signals(&self) -> Result<()> {
        if self.fail_signals.load(Ordering::SeqCst) {
            return Err(BackendError::Signal("mock signal failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, spec: &LaunchSpec, events: EventSender) -> Result<ExecutionHandle> {
        if self.hang_on_launch {
            std::future::pending::<()>().await;
        }

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }

        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(BackendError::LaunchFailed("mock launch failure".to_string()));
        }

        let handle = ExecutionHandle {
            execution_id: spec.execution_id.clone(),
            handle_id: format!("mock-{}", spec.execution_id),
            started_at: Utc::now(),
            pid: None,
        };

        self.executions.lock().await.insert(
            spec.execution_id.clone(),
            MockExecution {
                app_id: spec.app_id.clone(),
                events: events.clone(),
                paused: false,
                stdin: Vec::new(),
            },
        );
        self.launches.fetch_add(1, Ordering::SeqCst);

        if let Some(code) = self.exit_immediately {
            self.executions.lock().await.remove(&spec.execution_id);
            let execution_id = spec.execution_id.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(BackendEvent::Terminated {
                        execution_id,
                        exit_code: Some(code),
                    })
                    .await;
            });
        }

        Ok(handle)
    }

    async fn pause(&self, handle: &ExecutionHandle) -> Result<()> {
        self.check_signals()?;
        let mut executions = self.executions.lock().await;
        let execution = executions
            .get_mut(&handle.execution_id)
            .ok_or_else(|| BackendError::NotRunning(handle.execution_id.clone()))?;
        execution.paused = true;
        Ok(())
    }

    async fn resume(&self, handle: &ExecutionHandle) -> Result<()> {
        self.check_signals()?;
        let mut executions = self.executions.lock().await;
        let execution = executions
            .get_mut(&handle.execution_id)
            .ok_or_else(|| BackendError::NotRunning(handle.execution_id.clone()))?;
        execution.paused = false;
        Ok(())
    }

    async fn terminate(&self, handle: &ExecutionHandle) -> Result<()> {
        self.check_signals()?;
        if !self.terminate_delay.is_zero() {
            tokio::time::sleep(self.terminate_delay).await;
        }

        // Already gone counts as terminated.
        let Some(execution) = self.executions.lock().await.remove(&handle.execution_id) else {
            return Ok(());
        };
        let _ = execution
            .events
            .send(BackendEvent::Terminated {
                execution_id: handle.execution_id.clone(),
                exit_code: Some(TERMINATED_EXIT_CODE),
            })
            .await;
        Ok(())
    }

    async fn write_input(&self, handle: &ExecutionHandle, bytes: &[u8]) -> Result<()> {
        let mut executions = self.executions.lock().await;
        let execution = executions
            .get_mut(&handle.execution_id)
            .ok_or_else(|| BackendError::NotRunning(handle.execution_id.clone()))?;
        execution.stdin.extend_from_slice(bytes);
        Ok(())
    }

    async fn discard(&self, app_id: &str) -> Result<()> {
        self.discarded.lock().await.push(app_id.to_string());
        Ok(())
    }
}
