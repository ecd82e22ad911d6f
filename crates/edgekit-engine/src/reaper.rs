// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that discards closed execution sessions.
//!
//! A session (and its output buffer) outlives its process so that clients
//! can still subscribe and read what it printed. Once the grace period has
//! passed since it ended, the session is removed and its buffer released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::engine::Engine;

/// Configuration for the session reaper.
#[derive(Debug, Clone)]
pub struct SessionReaperConfig {
    /// How often to scan for expired sessions.
    pub poll_interval: Duration,
    /// How long a closed session is kept.
    pub grace: Duration,
}

impl Default for SessionReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            grace: Duration::from_secs(300),
        }
    }
}

/// Background worker that reaps closed execution sessions.
pub struct SessionReaper {
    engine: Arc<Engine>,
    config: SessionReaperConfig,
    shutdown: Arc<Notify>,
}

impl SessionReaper {
    pub fn new(engine: Arc<Engine>, config: SessionReaperConfig) -> Self {
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

    /// Run until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "Session reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Session reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let reaped = self.engine.reap_sessions(self.config.grace);
                    if reaped > 0 {
                        info!(reaped, "Reaped closed execution sessions");
                    } else {
                        debug!("No expired execution sessions");
                    }
                }
            }
        }

        info!("Session reaper stopped");
    }
}
