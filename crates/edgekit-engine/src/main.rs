// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgekit Engine - application lifecycle orchestration for edge nodes
//!
//! A WebSocket server responsible for:
//! - Installing applications and resolving their identifiers
//! - Driving the lifecycle (start, stop, pause, resume, restart, remove)
//! - Streaming execution output to subscribed clients

use std::sync::Arc;
use tracing::{info, warn};

use edgekit_engine::backend::{ExecutionBackend, MockBackend, ProcessBackend, ProcessBackendConfig};
use edgekit_engine::config::{BackendKind, Config, LogFormat};
use edgekit_engine::runtime::EngineRuntime;
use edgekit_engine::store::{AppStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present, before reading the log format
    let dotenv = dotenvy::dotenv();

    let config = Config::from_env()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edgekit_engine=info,edgekit_protocol=info".into());
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        runtime_name = %config.runtime_name,
        "Starting Edgekit Engine"
    );

    let backend: Arc<dyn ExecutionBackend> = match config.backend {
        BackendKind::Process => Arc::new(ProcessBackend::new(ProcessBackendConfig {
            data_dir: config.data_dir.clone(),
            python: config.python.clone(),
            container_cli: config.container_cli.clone(),
            ..Default::default()
        })),
        BackendKind::Mock => {
            warn!("Using mock backend, applications will not actually run");
            Arc::new(MockBackend::new())
        }
    };
    info!(backend = backend.backend_type(), "Backend initialized");

    let store: Arc<dyn AppStore> = match &config.database_url {
        Some(url) => {
            let store = SqliteStore::open(url).await?;
            info!("Connected to database");
            Arc::new(store)
        }
        None => {
            warn!("EDGEKIT_DATABASE_URL not set, application records will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Start the runtime
    let runtime = EngineRuntime::builder()
        .config(&config)
        .backend(backend)
        .store(store)
        .build()?
        .start()
        .await?;

    info!(url = %runtime.ws_url(), "Edgekit Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Edgekit Engine shut down");

    Ok(())
}
