// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestration engine.
//!
//! [`Engine`] ties the components together. Every lifecycle action follows
//! the same path:
//!
//! 1. resolve the identifier (`NotFound` before anything else),
//! 2. take a ticket in the application's operation queue,
//! 3. wait for the lock and re-read the record,
//! 4. plan the transition, publish the intermediate state,
//! 5. call the backend under a deadline,
//! 6. commit the target state (or `error`) and persist it.
//!
//! Backend terminations enter through [`Engine::handle_backend_event`] and
//! take the same lock, so a crash can never interleave with a client
//! `stop`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use edgekit_protocol::message::{
    AppState, InstallRequest, LifecycleAction, OutputTarget, RuntimeInfo, ServerMessage,
    StateChangedMessage, SubscriptionInfo,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::backend::{BackendError, BackendEvent, ExecutionBackend, ExecutionHandle, LaunchSpec};
use crate::clients::{ClientHandle, ClientId, ClientRegistry};
use crate::config::{Config, Limits};
use crate::error::{Error, Result};
use crate::executions::Executions;
use crate::identifier::IdentifierResolver;
use crate::lifecycle::{self, Transition};
use crate::oplock::{OperationLocks, Ticket};
use crate::output::OutputMultiplexer;
use crate::registry::{ApplicationRecord, Registry};
use crate::store::AppStore;

/// Capacity of the backend event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Display name reported by `runtime_info`.
    pub runtime_name: String,
    pub limits: Limits,
    /// Deadline for one backend acknowledgement.
    pub backend_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            runtime_name: "Runtime-MyRuntime".to_string(),
            limits: Limits::default(),
            backend_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            runtime_name: config.runtime_name.clone(),
            limits: config.limits.clone(),
            backend_timeout: config.backend_timeout,
        }
    }
}

/// A lifecycle action whose place in the application's queue is fixed.
#[derive(Debug)]
pub struct PreparedAction {
    pub action: LifecycleAction,
    pub app_id: String,
    /// Registry generation the action was issued against.
    generation: u64,
    ticket: Ticket,
}

/// Result of a lifecycle action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub app_id: String,
    pub action: LifecycleAction,
    /// State after the action.
    pub state: AppState,
    /// Live execution after the action.
    pub execution_id: Option<String>,
}

impl ActionOutcome {
    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let verb = match self.action {
            LifecycleAction::Start => "started",
            LifecycleAction::Stop => "stopped",
            LifecycleAction::Pause => "paused",
            LifecycleAction::Resume => "resumed",
            LifecycleAction::Restart => "restarted",
            LifecycleAction::Remove => "removed",
        };
        format!("Application {} {}", self.app_id, verb)
    }
}

/// Application lifecycle orchestration engine.
pub struct Engine {
    settings: EngineSettings,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn AppStore>,
    ids: IdentifierResolver,
    registry: Registry,
    locks: OperationLocks,
    executions: Executions,
    output: OutputMultiplexer,
    clients: ClientRegistry,
    /// Serializes start admission checks with session creation.
    admission: Mutex<()>,
    events: mpsc::Sender<BackendEvent>,
    started_at: Instant,
}

impl Engine {
    /// Create an engine. The receiver must be driven with
    /// [`run_event_pump`](Self::run_event_pump).
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn AppStore>,
    ) -> (Arc<Self>, mpsc::Receiver<BackendEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let limits = &settings.limits;
        let engine = Arc::new(Self {
            ids: IdentifierResolver::new(),
            registry: Registry::new(),
            locks: OperationLocks::new(limits.max_pending_ops),
            executions: Executions::new(),
            output: OutputMultiplexer::new(limits.output_buffer_bytes),
            clients: ClientRegistry::new(limits.subscriber_queue_len),
            admission: Mutex::new(()),
            events,
            started_at: Instant::now(),
            backend,
            store,
            settings,
        });
        (engine, events_rx)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn executions(&self) -> &Executions {
        &self.executions
    }

    pub fn output(&self) -> &OutputMultiplexer {
        &self.output
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Load records left by a previous run.
    ///
    /// No process survives a restart of the engine, so records whose state
    /// implies a live execution are moved to `error`.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.store.load_all().await?;
        let count = records.len();

        for mut record in records {
            self.ids.restore(&record.canonical_id, &record.aliases);
            record.aliases = self.ids.aliases_of(&record.canonical_id);
            record.execution = None;

            if !matches!(
                record.state,
                AppState::Installed | AppState::Stopped | AppState::Error
            ) {
                warn!(
                    app_id = %record.canonical_id,
                    state = %record.state,
                    "Application was live when the engine stopped, marking as error"
                );
                record.state = AppState::Error;
                record.last_transition_at = Utc::now();
                self.persist(&record).await;
            }
            self.registry.insert(record);
        }

        if count > 0 {
            info!(applications = count, "Recovered application records");
        }
        Ok(count)
    }

    // ========================================================================
    // Install
    // ========================================================================

    /// Install a new application in state `installed`.
    pub async fn install(&self, request: InstallRequest) -> Result<ApplicationRecord> {
        let payload = match request.payload {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(Error::Validation("payload must be a JSON object".to_string())),
        };

        let canonical_id =
            self.ids
                .reserve(&request.app_id, &request.aliases, self.settings.limits.max_apps)?;

        let now = Utc::now();
        let record = ApplicationRecord {
            display_name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| request.app_id.trim().to_string()),
            app_kind: request.app_kind,
            state: AppState::Installed,
            execution: None,
            last_execution_id: None,
            created_at: now,
            last_transition_at: now,
            last_exit_code: None,
            aliases: self.ids.aliases_of(&canonical_id),
            dependencies: request.dependencies,
            signals: request.signals,
            payload,
            canonical_id,
        };

        if let Err(e) = self.store.save(&record).await {
            self.ids.release(&record.canonical_id);
            error!(app_id = %record.canonical_id, error = %e, "Failed to persist new application");
            return Err(e.into());
        }
        self.registry.insert(record.clone());

        info!(
            app_id = %record.canonical_id,
            requested_id = %request.app_id,
            app_kind = ?record.app_kind,
            "Application installed"
        );
        Ok(record)
    }

    // ========================================================================
    // Lifecycle actions
    // ========================================================================

    /// Resolve the target and take a place in its operation queue.
    ///
    /// Synchronous, so callers that prepare in arrival order get their
    /// actions applied in arrival order.
    pub fn prepare(&self, action: LifecycleAction, raw_id: &str) -> Result<PreparedAction> {
        let app_id = self.ids.require(raw_id)?;
        let generation = self
            .registry
            .generation(&app_id)
            .ok_or_else(|| Error::NotFound(app_id.clone()))?;
        let ticket = self.locks.reserve(&app_id)?;
        Ok(PreparedAction {
            action,
            app_id,
            generation,
            ticket,
        })
    }

    /// Run a prepared action once its turn comes.
    pub async fn execute(&self, prepared: PreparedAction) -> Result<ActionOutcome> {
        let PreparedAction {
            action,
            app_id,
            generation,
            ticket,
        } = prepared;

        let _guard = ticket.acquire().await;

        // The operation ahead of us may have removed the application, and
        // the id may since belong to a new installation.
        let record = self
            .registry
            .get_generation(&app_id, generation)
            .ok_or_else(|| Error::NotFound(app_id.clone()))?;

        let transition =
            lifecycle::plan(record.state, action).map_err(|rejection| {
                debug!(app_id = %app_id, rejection = %rejection, "Transition rejected");
                Error::InvalidTransition {
                    app_id: app_id.clone(),
                    rejection,
                }
            })?;

        let record = match action {
            LifecycleAction::Start => self.start(record, transition).await?,
            LifecycleAction::Stop => self.stop(record, transition).await?,
            LifecycleAction::Pause | LifecycleAction::Resume => {
                self.signal(record, transition).await?
            }
            LifecycleAction::Restart => self.restart(record, transition).await?,
            LifecycleAction::Remove => self.remove(record, transition).await?,
        };

        Ok(ActionOutcome {
            app_id,
            action,
            state: record.state,
            execution_id: record.execution.map(|h| h.execution_id),
        })
    }

    /// Prepare and execute in one call.
    pub async fn apply_action(&self, action: LifecycleAction, raw_id: &str) -> Result<ActionOutcome> {
        let prepared = self.prepare(action, raw_id)?;
        self.execute(prepared).await
    }

    async fn start(&self, record: ApplicationRecord, t: Transition) -> Result<ApplicationRecord> {
        let execution_id = self.admit(&record.canonical_id)?;
        self.set_state(&record.canonical_id, t.intermediate, |_| {})?;

        match self.launch(&record, &execution_id).await {
            Ok(handle) => self.commit_running(&record.canonical_id, t.target, handle).await,
            Err(e) => Err(self.fail(&record.canonical_id, e).await),
        }
    }

    async fn stop(&self, record: ApplicationRecord, t: Transition) -> Result<ApplicationRecord> {
        let app_id = record.canonical_id.as_str();
        self.set_state(app_id, t.intermediate, |_| {})?;

        if let Some(handle) = &record.execution
            && let Err(e) = self.with_deadline(self.backend.terminate(handle)).await
        {
            return Err(self.fail(app_id, e).await);
        }

        let record = self.set_state(app_id, t.target, |r| r.execution = None)?;
        self.persist(&record).await;
        info!(app_id = %app_id, "Application stopped");
        Ok(record)
    }

    async fn signal(&self, record: ApplicationRecord, t: Transition) -> Result<ApplicationRecord> {
        let app_id = record.canonical_id.as_str();
        let handle = record.execution.clone().ok_or_else(|| {
            Error::Internal(format!("{} is {} without an execution", app_id, record.state))
        })?;
        self.set_state(app_id, t.intermediate, |_| {})?;

        let acknowledged = match t.action {
            LifecycleAction::Pause => self.with_deadline(self.backend.pause(&handle)).await,
            _ => self.with_deadline(self.backend.resume(&handle)).await,
        };
        if let Err(e) = acknowledged {
            return Err(self.fail(app_id, e).await);
        }

        let record = self.set_state(app_id, t.target, |_| {})?;
        self.persist(&record).await;
        info!(app_id = %app_id, state = %record.state, "Application {}", t.action);
        Ok(record)
    }

    /// Stop-then-start as one operation. Observers see `starting` for the
    /// whole operation and never a `stopped` in between.
    async fn restart(&self, record: ApplicationRecord, t: Transition) -> Result<ApplicationRecord> {
        let app_id = record.canonical_id.as_str();

        // Replacing a live execution does not add to the running count.
        let execution_id = match &record.execution {
            Some(_) => self.open_session(app_id),
            None => self.admit(app_id)?,
        };
        self.set_state(app_id, t.intermediate, |_| {})?;

        if let Some(old) = &record.execution
            && let Err(e) = self.with_deadline(self.backend.terminate(old)).await
        {
            self.abandon_session(&execution_id);
            return Err(self.fail(app_id, e).await);
        }

        match self.launch(&record, &execution_id).await {
            Ok(handle) => self.commit_running(app_id, t.target, handle).await,
            Err(e) => Err(self.fail(app_id, e).await),
        }
    }

    async fn remove(&self, record: ApplicationRecord, t: Transition) -> Result<ApplicationRecord> {
        let app_id = record.canonical_id.as_str();
        self.set_state(app_id, t.intermediate, |_| {})?;

        if let Err(e) = self.with_deadline(self.backend.discard(app_id)).await {
            return Err(self.fail(app_id, e).await);
        }
        if let Err(e) = self.store.delete(app_id).await {
            warn!(app_id = %app_id, error = %e, "Failed to delete application record from store");
        }

        let mut removed = self
            .registry
            .remove(app_id)
            .ok_or_else(|| Error::NotFound(app_id.to_string()))?;
        removed.state = t.target;
        removed.last_transition_at = Utc::now();
        self.notify_state(&removed, None, None);

        self.ids.release(app_id);
        for execution_id in self.executions.remove_app(app_id) {
            self.output.discard(&execution_id);
        }
        self.locks.forget(app_id);

        info!(app_id = %app_id, "Application removed");
        Ok(removed)
    }

    // ========================================================================
    // Transition helpers
    // ========================================================================

    /// Check start admission and open the new session under one lock.
    fn admit(&self, app_id: &str) -> Result<String> {
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let limits = &self.settings.limits;

        let active = self.executions.active_count();
        if active >= limits.max_running {
            return Err(Error::CapacityExceeded(format!(
                "{} executions already running (limit {})",
                active, limits.max_running
            )));
        }

        let reserved = self.output.reserved_bytes();
        if reserved + self.output.buffer_capacity() > limits.max_buffer_memory {
            return Err(Error::CapacityExceeded(format!(
                "output buffers would exceed {} bytes",
                limits.max_buffer_memory
            )));
        }

        Ok(self.open_session(app_id))
    }

    fn open_session(&self, app_id: &str) -> String {
        let execution_id = Uuid::new_v4().to_string();
        self.executions.open(&execution_id, app_id);
        self.output.open(&execution_id);
        execution_id
    }

    fn abandon_session(&self, execution_id: &str) {
        self.executions.close(execution_id, None);
        self.output.end(execution_id);
    }

    async fn launch(
        &self,
        record: &ApplicationRecord,
        execution_id: &str,
    ) -> std::result::Result<ExecutionHandle, BackendError> {
        let spec = LaunchSpec {
            execution_id: execution_id.to_string(),
            app_id: record.canonical_id.clone(),
            app_kind: record.app_kind,
            payload: record.payload.clone(),
            dependencies: record.dependencies.clone(),
        };

        let result = self
            .with_deadline(self.backend.launch(&spec, self.events.clone()))
            .await;
        if result.is_err() {
            self.abandon_session(execution_id);
        }
        result
    }

    async fn commit_running(
        &self,
        app_id: &str,
        target: AppState,
        handle: ExecutionHandle,
    ) -> Result<ApplicationRecord> {
        let execution_id = handle.execution_id.clone();
        let record = self.set_state(app_id, target, move |r| {
            r.last_execution_id = Some(handle.execution_id.clone());
            r.execution = Some(handle);
        })?;
        self.persist(&record).await;
        info!(app_id = %app_id, execution_id = %execution_id, "Application running");
        Ok(record)
    }

    /// Run a backend call under the backend deadline.
    async fn with_deadline<T, F>(&self, call: F) -> std::result::Result<T, BackendError>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        let deadline = self.settings.backend_timeout;
        tokio::time::timeout(deadline, call)
            .await
            .unwrap_or(Err(BackendError::Timeout(deadline)))
    }

    /// Move an application to `error` after a backend failure.
    ///
    /// Any execution still attached is terminated on a best-effort basis so
    /// no process outlives its handle.
    async fn fail(&self, app_id: &str, source: BackendError) -> Error {
        error!(app_id = %app_id, error = %source, "Backend operation failed");

        if let Some(handle) = self.registry.get(app_id).and_then(|r| r.execution)
            && let Err(e) = self.with_deadline(self.backend.terminate(&handle)).await
        {
            warn!(
                app_id = %app_id,
                execution_id = %handle.execution_id,
                error = %e,
                "Failed to terminate execution of failed application"
            );
        }

        if let Ok(record) = self.set_state(app_id, AppState::Error, |r| r.execution = None) {
            self.persist(&record).await;
        }
        Error::backend(app_id, source)
    }

    /// Update state and timestamp, apply `f`, and notify subscribers.
    /// Caller holds the application's lock.
    fn set_state<F>(&self, app_id: &str, state: AppState, f: F) -> Result<ApplicationRecord>
    where
        F: FnOnce(&mut ApplicationRecord),
    {
        let mut from = state;
        let mut previous = None;
        let record = self
            .registry
            .update(app_id, |r| {
                from = r.state;
                previous = r.current_or_last_execution().map(str::to_string);
                r.state = state;
                r.last_transition_at = Utc::now();
                f(r);
            })
            .ok_or_else(|| Error::NotFound(app_id.to_string()))?;

        debug_assert!(
            lifecycle::handle_consistent(record.state, record.execution.is_some()),
            "{} in {} with handle={}",
            app_id,
            record.state,
            record.execution.is_some()
        );
        debug!(app_id = %app_id, from = %from, to = %state, "State changed");
        self.notify_state(&record, None, previous.as_deref());
        Ok(record)
    }

    async fn persist(&self, record: &ApplicationRecord) {
        if let Err(e) = self.store.save(record).await {
            warn!(
                app_id = %record.canonical_id,
                state = %record.state,
                error = %e,
                "Failed to persist application record"
            );
        }
    }

    /// Push `state_changed` to clients subscribed to the application's
    /// current or most recent execution, or to `previous` (the execution
    /// being replaced by a restart).
    fn notify_state(&self, record: &ApplicationRecord, exit_code: Option<i32>, previous: Option<&str>) {
        let execution_id = record.current_or_last_execution().map(str::to_string);

        let mut recipients: Vec<ClientId> = Vec::new();
        let executions = [
            record.execution.as_ref().map(|h| h.execution_id.as_str()),
            record.last_execution_id.as_deref(),
            previous,
        ];
        for id in executions.into_iter().flatten() {
            for client in self.output.subscribers_of(id) {
                if !recipients.contains(&client) {
                    recipients.push(client);
                }
            }
        }
        if recipients.is_empty() {
            return;
        }

        let message = ServerMessage::StateChanged(StateChangedMessage {
            app_id: record.canonical_id.clone(),
            execution_id,
            state: record.state,
            exit_code,
            timestamp: record.last_transition_at,
        });
        for client in recipients {
            self.clients.send(client, message.clone());
        }
    }

    // ========================================================================
    // Backend events
    // ========================================================================

    /// Drive backend events until the channel closes or `shutdown` fires.
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BackendEvent>,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        info!(backend = self.backend.backend_type(), "Backend event pump started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!("Backend event pump received shutdown signal");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_backend_event(event),
                    None => break,
                },
            }
        }
        info!("Backend event pump stopped");
    }

    /// Apply one backend event.
    ///
    /// Output is published immediately. A termination closes the session at
    /// once and queues the state transition behind the application's lock.
    pub fn handle_backend_event(self: &Arc<Self>, event: BackendEvent) {
        match event {
            BackendEvent::Output {
                execution_id,
                stream,
                bytes,
            } => {
                if self.output.publish(&execution_id, stream, &bytes).is_none() {
                    trace!(execution_id = %execution_id, "Dropped output of unknown execution");
                }
            }
            BackendEvent::Terminated {
                execution_id,
                exit_code,
            } => {
                self.executions.close(&execution_id, exit_code);
                self.output.end(&execution_id);

                let Some(session) = self.executions.get(&execution_id) else {
                    debug!(execution_id = %execution_id, "Termination of unknown execution");
                    return;
                };
                let ticket = self.locks.reserve_unbounded(&session.app_id);
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.apply_termination(ticket, &execution_id, exit_code).await;
                });
            }
        }
    }

    async fn apply_termination(&self, ticket: Ticket, execution_id: &str, exit_code: Option<i32>) {
        let guard = ticket.acquire().await;
        let app_id = guard.app_id();

        let Some(record) = self.registry.get(app_id) else {
            return;
        };

        let owns_execution = record
            .execution
            .as_ref()
            .is_some_and(|h| h.execution_id == execution_id);

        if owns_execution && let Some(next) = lifecycle::on_terminated(record.state, exit_code) {
            match self.set_state_with_exit(app_id, next, exit_code) {
                Ok(record) => {
                    self.persist(&record).await;
                    if next == AppState::Error {
                        warn!(app_id = %app_id, execution_id = %execution_id, exit_code = ?exit_code, "Application exited abnormally");
                    } else {
                        info!(app_id = %app_id, execution_id = %execution_id, "Application exited");
                    }
                }
                Err(e) => warn!(app_id = %app_id, error = %e, "Failed to apply termination"),
            }
        } else if record.last_execution_id.as_deref() == Some(execution_id) {
            // Stopped by a client: the state is already committed, only the
            // exit code is new.
            if let Some(record) = self.registry.update(app_id, |r| r.last_exit_code = exit_code) {
                self.persist(&record).await;
            }
        } else {
            debug!(app_id = %app_id, execution_id = %execution_id, "Stale termination event");
        }
    }

    fn set_state_with_exit(
        &self,
        app_id: &str,
        state: AppState,
        exit_code: Option<i32>,
    ) -> Result<ApplicationRecord> {
        let record = self
            .registry
            .update(app_id, |r| {
                r.state = state;
                r.last_transition_at = Utc::now();
                r.execution = None;
                r.last_exit_code = exit_code;
            })
            .ok_or_else(|| Error::NotFound(app_id.to_string()))?;
        self.notify_state(&record, exit_code, None);
        Ok(record)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of one application.
    pub fn status(&self, raw_id: &str) -> Result<ApplicationRecord> {
        let app_id = self.ids.require(raw_id)?;
        self.registry.get(&app_id).ok_or(Error::NotFound(app_id))
    }

    /// Resolve an identifier without touching anything.
    pub fn resolve(&self, raw_id: &str) -> Option<String> {
        self.ids.resolve(raw_id)
    }

    pub fn list(&self, state: Option<AppState>) -> Vec<ApplicationRecord> {
        self.registry.list(state)
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        RuntimeInfo {
            runtime_name: self.settings.runtime_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            applications: self.registry.len(),
            by_state: self.registry.count_by_state(),
            active_executions: self.executions.active_count(),
            connected_clients: self.clients.connected(),
            pending_requests: self.clients.pending_count(),
            buffered_bytes: self.output.buffered_bytes(),
        }
    }

    pub async fn health_check(&self) -> bool {
        matches!(self.store.health_check().await, Ok(true))
    }

    // ========================================================================
    // Output and input
    // ========================================================================

    /// Execution selected by `target`: an explicit execution id, or the
    /// current or most recent execution of an application.
    pub fn resolve_execution(&self, target: &OutputTarget) -> Result<String> {
        match (&target.execution_id, &target.app_id) {
            (Some(execution_id), _) => {
                if self.executions.get(execution_id).is_some() || self.output.contains(execution_id)
                {
                    Ok(execution_id.clone())
                } else {
                    Err(Error::NotFound(format!("execution {}", execution_id)))
                }
            }
            (None, Some(raw_id)) => {
                let record = self.status(raw_id)?;
                record
                    .current_or_last_execution()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "application {} has never been started",
                            record.canonical_id
                        ))
                    })
            }
            (None, None) => Err(Error::Validation(
                "one of executionId or appId is required".to_string(),
            )),
        }
    }

    /// Subscribe a client to an execution's output.
    pub fn subscribe_output(
        &self,
        client: &ClientHandle,
        target: &OutputTarget,
    ) -> Result<SubscriptionInfo> {
        let execution_id = self.resolve_execution(target)?;
        let info = self
            .output
            .subscribe(&execution_id, client.id, client.output.clone())
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;
        debug!(
            client_id = client.id,
            execution_id = %execution_id,
            replayed = info.replayed,
            "Client subscribed to output"
        );
        Ok(info)
    }

    /// Returns the execution id and whether a subscription existed.
    pub fn unsubscribe_output(&self, client_id: ClientId, target: &OutputTarget) -> Result<(String, bool)> {
        let execution_id = self.resolve_execution(target)?;
        let removed = self.output.unsubscribe(&execution_id, client_id);
        Ok((execution_id, removed))
    }

    /// Forget a disconnected client. Executions and records are untouched.
    pub fn disconnect(&self, client_id: ClientId) {
        let subscriptions = self.output.unsubscribe_all(client_id);
        if self.clients.disconnect(client_id).is_some() {
            info!(client_id, subscriptions, "Client disconnected");
        }
    }

    /// Write bytes to a running execution's standard input.
    pub async fn write_input(&self, target: &OutputTarget, bytes: &[u8]) -> Result<()> {
        let execution_id = self.resolve_execution(target)?;
        let session = self
            .executions
            .get(&execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;
        let handle = self
            .registry
            .get(&session.app_id)
            .and_then(|r| r.execution)
            .filter(|h| h.execution_id == execution_id)
            .ok_or_else(|| {
                Error::Validation(format!("execution {} is not running", execution_id))
            })?;

        self.with_deadline(self.backend.write_input(&handle, bytes))
            .await
            .map_err(|e| Error::backend(session.app_id, e))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Discard sessions closed longer than `grace` ago with their buffers.
    pub fn reap_sessions(&self, grace: Duration) -> usize {
        let reaped = self.executions.reap(grace, Utc::now());
        for execution_id in &reaped {
            self.output.discard(execution_id);
        }
        reaped.len()
    }

    /// Stop executions that have been running longer than `max_age`.
    pub async fn stop_expired(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut stopped = 0;

        for record in self.registry.with_execution() {
            let Some(handle) = &record.execution else {
                continue;
            };
            if now.signed_duration_since(handle.started_at) < max_age {
                continue;
            }

            match self
                .apply_action(LifecycleAction::Stop, &record.canonical_id)
                .await
            {
                Ok(_) => {
                    info!(
                        app_id = %record.canonical_id,
                        execution_id = %handle.execution_id,
                        "Stopped execution that exceeded its maximum lifetime"
                    );
                    stopped += 1;
                }
                Err(e @ (Error::OperationInProgress(_) | Error::InvalidTransition { .. })) => {
                    debug!(app_id = %record.canonical_id, error = %e, "Expired execution busy, retrying later");
                }
                Err(e) => {
                    warn!(app_id = %record.canonical_id, error = %e, "Failed to stop expired execution");
                }
            }
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::store::MemoryStore;
    use edgekit_protocol::message::AppKind;
    use serde_json::json;

    fn engine_with(backend: MockBackend) -> (Arc<Engine>, Arc<MockBackend>, Arc<MemoryStore>) {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryStore::new());
        let (engine, rx) = Engine::new(EngineSettings::default(), backend.clone(), store.clone());
        tokio::spawn(engine.clone().run_event_pump(rx, Arc::new(tokio::sync::Notify::new())));
        (engine, backend, store)
    }

    fn install_request(id: &str) -> InstallRequest {
        InstallRequest::new(id, AppKind::Interpreted, json!({"code": "print(1)"}))
    }

    #[tokio::test]
    async fn test_install_persists_record() {
        let (engine, _, store) = engine_with(MockBackend::new());
        let record = engine.install(install_request("app-1")).await.unwrap();
        assert_eq!(record.state, AppState::Installed);
        assert_eq!(store.get("app-1").await.unwrap().state, AppState::Installed);
    }

    #[tokio::test]
    async fn test_install_rolls_back_reservation_when_store_fails() {
        let (engine, _, store) = engine_with(MockBackend::new());
        store.set_fail_writes(true);
        assert!(matches!(
            engine.install(install_request("app-1")).await,
            Err(Error::Store(_))
        ));
        assert!(engine.resolve("app-1").is_none());

        store.set_fail_writes(false);
        let record = engine.install(install_request("app-1")).await.unwrap();
        assert_eq!(record.canonical_id, "app-1");
    }

    #[tokio::test]
    async fn test_install_rejects_non_object_payload() {
        let (engine, _, _) = engine_with(MockBackend::new());
        let request = InstallRequest::new("x", AppKind::Interpreted, json!("print(1)"));
        assert!(matches!(engine.install(request).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_launch_lands_in_error() {
        let (engine, _, _) = engine_with(MockBackend::failing());
        engine.install(install_request("a")).await.unwrap();

        let err = engine.apply_action(LifecycleAction::Start, "a").await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));

        let record = engine.status("a").unwrap();
        assert_eq!(record.state, AppState::Error);
        assert!(record.execution.is_none());
        assert_eq!(engine.executions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_timeout_lands_in_error() {
        let backend = Arc::new(MockBackend::hanging());
        let store = Arc::new(MemoryStore::new());
        let settings = EngineSettings {
            backend_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (engine, _rx) = Engine::new(settings, backend, store);
        engine.install(install_request("a")).await.unwrap();

        let err = engine.apply_action(LifecycleAction::Start, "a").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Backend {
                source: BackendError::Timeout(_),
                ..
            }
        ));
        assert_eq!(engine.status("a").unwrap().state, AppState::Error);
    }

    #[tokio::test]
    async fn test_max_running_admission() {
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(MemoryStore::new());
        let settings = EngineSettings {
            limits: Limits {
                max_running: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let (engine, _rx) = Engine::new(settings, backend, store);
        engine.install(install_request("a")).await.unwrap();
        engine.install(install_request("b")).await.unwrap();

        engine.apply_action(LifecycleAction::Start, "a").await.unwrap();
        let err = engine.apply_action(LifecycleAction::Start, "b").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        // Rejected before any transition was published
        assert_eq!(engine.status("b").unwrap().state, AppState::Installed);

        // Restarting the running one replaces its execution
        engine.apply_action(LifecycleAction::Restart, "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_action_queued_behind_remove_never_reaches_reinstalled_app() {
        let settings = EngineSettings {
            limits: Limits {
                max_pending_ops: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let (engine, _rx) = Engine::new(
            settings,
            Arc::new(MockBackend::new()),
            Arc::new(MemoryStore::new()),
        );
        engine.install(install_request("a")).await.unwrap();
        engine.apply_action(LifecycleAction::Start, "a").await.unwrap();
        engine.apply_action(LifecycleAction::Stop, "a").await.unwrap();

        let remove = engine.prepare(LifecycleAction::Remove, "a").unwrap();
        let stale = engine.prepare(LifecycleAction::Start, "a").unwrap();
        engine.execute(remove).await.unwrap();

        let reinstalled = engine.install(install_request("a")).await.unwrap();
        assert_eq!(reinstalled.canonical_id, "a");
        let fresh = engine.prepare(LifecycleAction::Start, "a").unwrap();

        let (stale, fresh) = tokio::join!(engine.execute(stale), engine.execute(fresh));
        assert!(matches!(stale, Err(Error::NotFound(_))));
        assert_eq!(fresh.unwrap().state, AppState::Running);
        assert_eq!(engine.status("a").unwrap().state, AppState::Running);
    }

    #[tokio::test]
    async fn test_crash_transitions_to_error() {
        let (engine, backend, _) = engine_with(MockBackend::new());
        engine.install(install_request("a")).await.unwrap();
        let outcome = engine.apply_action(LifecycleAction::Start, "a").await.unwrap();
        let execution_id = outcome.execution_id.unwrap();

        backend.exit(&execution_id, 2).await;

        for _ in 0..100 {
            if engine.status("a").unwrap().state == AppState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let record = engine.status("a").unwrap();
        assert_eq!(record.state, AppState::Error);
        assert_eq!(record.last_exit_code, Some(2));
        assert!(record.execution.is_none());
        assert_eq!(
            engine.executions().get(&execution_id).unwrap().exit_code,
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_stop_records_exit_code_late() {
        let (engine, _, _) = engine_with(MockBackend::new());
        engine.install(install_request("a")).await.unwrap();
        engine.apply_action(LifecycleAction::Start, "a").await.unwrap();
        engine.apply_action(LifecycleAction::Stop, "a").await.unwrap();

        for _ in 0..100 {
            if engine.status("a").unwrap().last_exit_code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let record = engine.status("a").unwrap();
        assert_eq!(record.state, AppState::Stopped);
        assert_eq!(
            record.last_exit_code,
            Some(crate::backend::mock::TERMINATED_EXIT_CODE)
        );
    }

    #[tokio::test]
    async fn test_recover_marks_live_records_as_error() {
        let now = Utc::now();
        let mk = |id: &str, state| ApplicationRecord {
            canonical_id: id.to_string(),
            display_name: id.to_string(),
            app_kind: AppKind::CompiledBinary,
            state,
            execution: None,
            last_execution_id: None,
            created_at: now,
            last_transition_at: now,
            last_exit_code: None,
            aliases: vec![format!("q.{}", id)],
            dependencies: Vec::new(),
            signals: Vec::new(),
            payload: json!({}),
        };
        let store = Arc::new(MemoryStore::with_records([
            mk("running", AppState::Running),
            mk("stopping", AppState::Stopping),
            mk("stopped", AppState::Stopped),
        ]));
        let (engine, _rx) = Engine::new(
            EngineSettings::default(),
            Arc::new(MockBackend::new()),
            store.clone(),
        );

        assert_eq!(engine.recover().await.unwrap(), 3);
        assert_eq!(engine.status("running").unwrap().state, AppState::Error);
        assert_eq!(engine.status("q.stopping").unwrap().state, AppState::Error);
        assert_eq!(engine.status("stopped").unwrap().state, AppState::Stopped);
        assert_eq!(store.get("running").await.unwrap().state, AppState::Error);

        // Recovered ids take part in suffixing
        let record = engine.install(install_request("stopped")).await.unwrap();
        assert_eq!(record.canonical_id, "stopped_2");
    }

    #[tokio::test]
    async fn test_stop_expired() {
        let (engine, _, _) = engine_with(MockBackend::new());
        engine.install(install_request("a")).await.unwrap();
        engine.apply_action(LifecycleAction::Start, "a").await.unwrap();

        assert_eq!(engine.stop_expired(Duration::from_secs(3600)).await, 0);
        assert_eq!(engine.stop_expired(Duration::ZERO).await, 1);
        assert_eq!(engine.status("a").unwrap().state, AppState::Stopped);
    }

    #[tokio::test]
    async fn test_reap_sessions_discards_buffers() {
        let (engine, _, _) = engine_with(MockBackend::new());
        engine.install(install_request("a")).await.unwrap();
        let outcome = engine.apply_action(LifecycleAction::Start, "a").await.unwrap();
        let execution_id = outcome.execution_id.unwrap();
        engine.apply_action(LifecycleAction::Stop, "a").await.unwrap();

        for _ in 0..100 {
            if !engine.executions().get(&execution_id).unwrap().is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.reap_sessions(Duration::ZERO), 1);
        assert!(!engine.output().contains(&execution_id));
    }
}
