// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgekit Engine - Application Lifecycle Orchestration
//!
//! This crate is the control plane of an edge node. It installs
//! applications, drives them through their lifecycle on an execution
//! backend, and streams their output to clients over a WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                │
//! │                  (dashboards, CLI, edgekit-protocol)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ JSON over WebSocket (/ws)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      edgekit-engine (This Crate)                        │
//! │                              Port 8090                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Router /   │  │ Identifier  │  │  Lifecycle  │  │   Output    │     │
//! │  │  Sessions   │  │  Resolver   │  │ + Op Locks  │  │ Multiplexer │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                 │                   ▲
//!           │ save / load                     │ launch, signal    │ output,
//!           ▼                                 ▼                   │ exit
//! ┌───────────────────┐            ┌──────────────────────────────────────┐
//! │  AppStore         │            │  ExecutionBackend                    │
//! │  (SQLite/memory)  │            │  (processes, container CLI, mock)    │
//! └───────────────────┘            └──────────────────────────────────────┘
//! ```
//!
//! # Requests
//!
//! | Kind | Description |
//! |------|-------------|
//! | `install` | Register an application, returns its canonical id |
//! | `start` / `stop` | Launch or terminate the application's execution |
//! | `pause` / `resume` | Suspend or continue a running execution |
//! | `restart` | Replace the execution; observers never see `stopped` |
//! | `remove` | Discard a stopped application |
//! | `get_status` / `list` | Read application records |
//! | `subscribe_output` / `unsubscribe_output` | Follow an execution's output |
//! | `write_input` | Forward bytes to stdin (never answered) |
//! | `runtime_info` | Runtime name, version and counters |
//!
//! # Application State Machine
//!
//! ```text
//!   installed ─start─► starting ─► running ─pause─► pausing ─► paused
//!                          ▲           ▲                          │
//!                          │           └──── resuming ◄─resume────┘
//!                       restart
//!                          │
//!   running / paused ─stop─► stopping ─► stopped ─remove─► uninstalling ─► removed
//!
//!   clean exit ─► stopped        non-zero exit or backend failure ─► error
//! ```
//!
//! The full transition table lives in [`lifecycle`].
//!
//! # Modules
//!
//! - [`backend`]: Execution backends (process, mock)
//! - [`engine`]: The orchestrator
//! - [`identifier`]: Canonical ids and aliases
//! - [`lifecycle`]: Transition table
//! - [`oplock`]: Per-application operation queue
//! - [`output`]: Output ring buffers and fan-out
//! - [`server`]: WebSocket server and router
//! - [`store`]: Durable application records

/// Execution backends.
pub mod backend;

/// Connected clients and pending requests.
pub mod clients;

/// Configuration loaded from environment variables.
pub mod config;

/// The orchestration engine.
pub mod engine;

/// Engine error taxonomy.
pub mod error;

/// Execution session table.
pub mod executions;

/// Request handlers.
pub mod handlers;

/// Identifier resolution.
pub mod identifier;

/// Lifecycle state machine.
pub mod lifecycle;

/// Per-application operation lock.
pub mod oplock;

/// Output stream multiplexer.
pub mod output;

/// Background worker for reaping closed execution sessions.
pub mod reaper;

/// In-memory application registry.
pub mod registry;

/// Embeddable runtime.
pub mod runtime;

/// WebSocket server.
pub mod server;

/// Persistence of application records.
pub mod store;

/// Background worker enforcing the maximum execution lifetime.
pub mod watchdog;

pub use engine::Engine;
pub use error::{Error, Result};
pub use runtime::EngineRuntime;
