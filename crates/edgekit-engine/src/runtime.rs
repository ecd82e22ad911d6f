// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the edgekit engine.
//!
//! [`EngineRuntime`] assembles the engine, the WebSocket server and the
//! background workers, so the engine can run inside an existing tokio
//! application as well as from the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edgekit_engine::backend::MockBackend;
//! use edgekit_engine::runtime::EngineRuntime;
//! use edgekit_engine::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .backend(Arc::new(MockBackend::new()))
//!         .store(Arc::new(MemoryStore::new()))
//!         .bind_addr("127.0.0.1:8090".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... connect clients to ws://127.0.0.1:8090/ws ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::ExecutionBackend;
use crate::config::{Config, Limits};
use crate::engine::{Engine, EngineSettings};
use crate::reaper::{SessionReaper, SessionReaperConfig};
use crate::server::{ServerState, run_server};
use crate::store::AppStore;
use crate::watchdog::{ExecutionWatchdog, WatchdogConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    backend: Option<Arc<dyn ExecutionBackend>>,
    store: Option<Arc<dyn AppStore>>,
    bind_addr: SocketAddr,
    runtime_name: String,
    limits: Limits,
    request_timeout: Duration,
    backend_timeout: Duration,
    session_grace: Duration,
    reaper_poll_interval: Duration,
    max_execution: Option<Duration>,
    watchdog_poll_interval: Duration,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            store: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            runtime_name: "Runtime-MyRuntime".to_string(),
            limits: Limits::default(),
            request_timeout: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(60),
            session_grace: Duration::from_secs(300),
            reaper_poll_interval: Duration::from_secs(30),
            max_execution: None,
            watchdog_poll_interval: Duration::from_secs(10),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting carried by `config`. Collaborators still have to
    /// be set separately.
    pub fn config(mut self, config: &Config) -> Self {
        self.bind_addr = config.bind_addr;
        self.runtime_name = config.runtime_name.clone();
        self.limits = config.limits.clone();
        self.request_timeout = config.request_timeout;
        self.backend_timeout = config.backend_timeout;
        self.session_grace = config.session_grace;
        self.max_execution = config.max_execution;
        self
    }

    /// Set the execution backend (required).
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the application record store (required).
    pub fn store(mut self, store: Arc<dyn AppStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the bind address of the WebSocket server. Port 0 picks a free
    /// port; read it back with [`EngineRuntime::bind_addr`].
    ///
    /// Default: `0.0.0.0:8090`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Default: `Runtime-MyRuntime`
    pub fn runtime_name(mut self, name: impl Into<String>) -> Self {
        self.runtime_name = name.into();
        self
    }

    /// Set the admission and buffering limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the deadline for answering a deferred request.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the deadline for a single backend acknowledgement.
    ///
    /// Default: 60 seconds
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Set how long closed execution sessions are kept.
    ///
    /// Default: 300 seconds
    pub fn session_grace(mut self, grace: Duration) -> Self {
        self.session_grace = grace;
        self
    }

    /// Default: 30 seconds
    pub fn reaper_poll_interval(mut self, interval: Duration) -> Self {
        self.reaper_poll_interval = interval;
        self
    }

    /// Stop executions older than `max`. No limit unless set.
    pub fn max_execution(mut self, max: Duration) -> Self {
        self.max_execution = Some(max);
        self
    }

    /// Default: 10 seconds
    pub fn watchdog_poll_interval(mut self, interval: Duration) -> Self {
        self.watchdog_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        if self.limits.max_running == 0 {
            anyhow::bail!("max_running must be at least 1");
        }

        Ok(EngineRuntimeConfig {
            backend,
            store,
            bind_addr: self.bind_addr,
            settings: EngineSettings {
                runtime_name: self.runtime_name,
                limits: self.limits,
                backend_timeout: self.backend_timeout,
            },
            request_timeout: self.request_timeout,
            reaper: SessionReaperConfig {
                poll_interval: self.reaper_poll_interval,
                grace: self.session_grace,
            },
            watchdog: self.max_execution.map(|max_execution| WatchdogConfig {
                poll_interval: self.watchdog_poll_interval,
                max_execution,
            }),
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn AppStore>,
    bind_addr: SocketAddr,
    settings: EngineSettings,
    request_timeout: Duration,
    reaper: SessionReaperConfig,
    watchdog: Option<WatchdogConfig>,
}

impl EngineRuntimeConfig {
    /// Recover stored records, bind the listener and spawn all tasks.
    pub async fn start(self) -> Result<EngineRuntime> {
        let (engine, events) = Engine::new(self.settings, self.backend, self.store);

        let recovered = engine.recover().await?;
        debug!(recovered, "Startup recovery finished");

        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;

        // Backend event pump
        let pump_shutdown = Arc::new(Notify::new());
        let pump_handle = tokio::spawn(engine.clone().run_event_pump(events, pump_shutdown.clone()));

        // Session reaper
        let reaper = SessionReaper::new(engine.clone(), self.reaper);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        // Execution watchdog
        let watchdog = self.watchdog.map(|config| {
            let watchdog = ExecutionWatchdog::new(engine.clone(), config);
            let shutdown = watchdog.shutdown_handle();
            let handle = tokio::spawn(async move {
                watchdog.run().await;
            });
            (handle, shutdown)
        });

        // WebSocket server
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let state = Arc::new(ServerState::new(
            engine.clone(),
            self.request_timeout,
            server_shutdown_rx,
        ));
        let server_handle = tokio::spawn(run_server(listener, state));

        info!(
            bind_addr = %bind_addr,
            backend = engine.backend_type(),
            applications = recovered,
            watchdog = watchdog.is_some(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            server_handle,
            pump_handle,
            reaper_handle,
            watchdog,
            server_shutdown_tx,
            pump_shutdown,
            reaper_shutdown,
            engine,
            bind_addr,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - WebSocket server for client connections
/// - Backend event pump (output and terminations)
/// - Session reaper for closed executions
/// - Execution watchdog (when a maximum lifetime is configured)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    server_handle: JoinHandle<Result<()>>,
    pump_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    watchdog: Option<(JoinHandle<()>, Arc<Notify>)>,
    server_shutdown_tx: watch::Sender<bool>,
    pump_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
    engine: Arc<Engine>,
    bind_addr: SocketAddr,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Address the WebSocket server is listening on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// WebSocket URL of the control channel, for local clients.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.bind_addr)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the server and every worker, then waits for them. Running
    /// executions are left to the backend.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.reaper_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.watchdog {
            shutdown.notify_one();
        }

        if let Err(e) = self.reaper_handle.await {
            error!("Session reaper task panicked: {}", e);
        }

        if let Some((handle, _)) = self.watchdog
            && let Err(e) = handle.await
        {
            error!("Execution watchdog task panicked: {}", e);
        }

        let server = self.server_handle.await;

        // Stop the pump last so terminations during shutdown still land.
        self.pump_shutdown.notify_one();
        if let Err(e) = self.pump_handle.await {
            error!("Backend event pump task panicked: {}", e);
        }

        match server {
            Ok(Ok(())) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("EngineRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("EngineRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let watchdog_running = self
            .watchdog
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());

        !self.server_handle.is_finished()
            && !self.pump_handle.is_finished()
            && !self.reaper_handle.is_finished()
            && watchdog_running
    }
}
