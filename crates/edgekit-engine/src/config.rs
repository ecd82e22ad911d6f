// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for edgekit-engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Global admission limits enforced at install and start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of installed applications.
    pub max_apps: usize,
    /// Maximum number of concurrently active executions.
    pub max_running: usize,
    /// Ring buffer capacity per execution, in bytes.
    pub output_buffer_bytes: usize,
    /// Total memory all output buffers together may reserve.
    pub max_buffer_memory: usize,
    /// Outbound chunk queue length per subscribed client.
    pub subscriber_queue_len: usize,
    /// Operations allowed to wait behind the running one, per application.
    pub max_pending_ops: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_apps: 64,
            max_running: 16,
            output_buffer_bytes: 10 * 1024 * 1024,
            max_buffer_memory: 256 * 1024 * 1024,
            subscriber_queue_len: 1024,
            max_pending_ops: 1,
        }
    }
}

/// Which execution backend the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local processes and the container CLI.
    Process,
    /// In-memory backend, for demos and tests.
    Mock,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listen address
    pub bind_addr: SocketAddr,
    /// SQLite database for durable records; in-memory store when absent
    pub database_url: Option<String>,
    /// Data directory for materialised application payloads
    pub data_dir: PathBuf,
    /// Display name reported by `runtime_info`
    pub runtime_name: String,
    pub backend: BackendKind,
    /// CLI used for container-image applications
    pub container_cli: String,
    /// Interpreter for interpreted applications
    pub python: String,
    pub limits: Limits,
    /// Deadline for a pending request before `REQUEST_TIMEOUT` is sent
    pub request_timeout: Duration,
    /// Deadline for one backend acknowledgement
    pub backend_timeout: Duration,
    /// How long closed execution sessions are kept for late subscribers
    pub session_grace: Duration,
    /// Maximum lifetime of one execution, unlimited when `None`
    pub max_execution: Option<Duration>,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional:
    /// - `EDGEKIT_PORT`: WebSocket port (default: 8090)
    /// - `EDGEKIT_DATABASE_URL`: SQLite URL or path (default: in-memory store)
    /// - `DATA_DIR`: data directory (default: `.data`)
    /// - `EDGEKIT_RUNTIME_PREFIX` / `EDGEKIT_RUNTIME_NAME`: display name parts
    /// - `EDGEKIT_BACKEND`: `process` or `mock` (default: process)
    /// - `EDGEKIT_MAX_APPS`, `EDGEKIT_MAX_RUNNING`, `EDGEKIT_OUTPUT_BUFFER_BYTES`,
    ///   `EDGEKIT_MAX_BUFFER_MEMORY`, `EDGEKIT_SUBSCRIBER_QUEUE`,
    ///   `EDGEKIT_MAX_PENDING_OPS`: admission limits
    /// - `EDGEKIT_REQUEST_TIMEOUT_SECS`, `EDGEKIT_BACKEND_TIMEOUT_SECS`,
    ///   `EDGEKIT_SESSION_GRACE_SECS`, `EDGEKIT_MAX_EXECUTION_SECS`: timeouts
    /// - `EDGEKIT_LOG_FORMAT`: `text` or `json`
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = parse_var("EDGEKIT_PORT", 8090, "must be a valid port number")?;

        let database_url = std::env::var("EDGEKIT_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let prefix =
            std::env::var("EDGEKIT_RUNTIME_PREFIX").unwrap_or_else(|_| "Runtime-".to_string());
        let name = std::env::var("EDGEKIT_RUNTIME_NAME").unwrap_or_else(|_| "MyRuntime".to_string());

        let backend = match std::env::var("EDGEKIT_BACKEND").as_deref() {
            Err(_) | Ok("process") => BackendKind::Process,
            Ok("mock") => BackendKind::Mock,
            Ok(_) => return Err(ConfigError::Invalid("EDGEKIT_BACKEND", "must be process or mock")),
        };

        let log_format = match std::env::var("EDGEKIT_LOG_FORMAT").as_deref() {
            Err(_) | Ok("text") => LogFormat::Text,
            Ok("json") => LogFormat::Json,
            Ok(_) => return Err(ConfigError::Invalid("EDGEKIT_LOG_FORMAT", "must be text or json")),
        };

        let defaults = Limits::default();
        let limits = Limits {
            max_apps: parse_positive("EDGEKIT_MAX_APPS", defaults.max_apps)?,
            max_running: parse_positive("EDGEKIT_MAX_RUNNING", defaults.max_running)?,
            output_buffer_bytes: parse_positive(
                "EDGEKIT_OUTPUT_BUFFER_BYTES",
                defaults.output_buffer_bytes,
            )?,
            max_buffer_memory: parse_positive(
                "EDGEKIT_MAX_BUFFER_MEMORY",
                defaults.max_buffer_memory,
            )?,
            subscriber_queue_len: parse_positive(
                "EDGEKIT_SUBSCRIBER_QUEUE",
                defaults.subscriber_queue_len,
            )?,
            max_pending_ops: parse_var(
                "EDGEKIT_MAX_PENDING_OPS",
                defaults.max_pending_ops,
                "must be a non-negative integer",
            )?,
        };

        let request_timeout = parse_secs("EDGEKIT_REQUEST_TIMEOUT_SECS", 30)?;
        let backend_timeout = parse_secs("EDGEKIT_BACKEND_TIMEOUT_SECS", 60)?;
        let session_grace = parse_secs("EDGEKIT_SESSION_GRACE_SECS", 300)?;
        let max_execution = Some(parse_secs("EDGEKIT_MAX_EXECUTION_SECS", 0)?)
            .filter(|d| !d.is_zero());

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            database_url,
            data_dir,
            runtime_name: format!("{}{}", prefix, name),
            backend,
            container_cli: std::env::var("EDGEKIT_CONTAINER_CLI")
                .unwrap_or_else(|_| "docker".to_string()),
            python: std::env::var("EDGEKIT_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            limits,
            request_timeout,
            backend_timeout,
            session_grace,
            max_execution,
            log_format,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn parse_positive(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value = parse_var(key, default, "must be a positive integer")?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn parse_secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(key, default, "must be a number of seconds").map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
