// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that enforces a maximum execution lifetime.
//!
//! Executions older than the limit are stopped through the normal locked
//! `stop` path, so subscribers see the usual `stopping`/`stopped`
//! transitions and a concurrent client operation is never overtaken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::engine::Engine;

/// Configuration for the execution watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often to check running executions.
    pub poll_interval: Duration,
    /// Maximum lifetime of one execution.
    pub max_execution: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_execution: Duration::from_secs(3600),
        }
    }
}

/// Background worker that stops executions exceeding their lifetime.
pub struct ExecutionWatchdog {
    engine: Arc<Engine>,
    config: WatchdogConfig,
    shutdown: Arc<Notify>,
}

impl ExecutionWatchdog {
    pub fn new(engine: Arc<Engine>, config: WatchdogConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_execution_secs = self.config.max_execution.as_secs(),
            "Execution watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Execution watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let stopped = self.engine.stop_expired(self.config.max_execution).await;
                    if stopped > 0 {
                        info!(stopped, "Stopped expired executions");
                    } else {
                        debug!("No expired executions");
                    }
                }
            }
        }

        info!("Execution watchdog stopped");
    }
}
