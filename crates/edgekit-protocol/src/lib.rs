// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgekit Protocol - JSON messages over a WebSocket control channel
//!
//! This crate defines the wire contract between clients and the edgekit
//! engine, and ships a small async client used by tooling and tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    edgekit-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Correlation: caller-chosen correlationId echoed in replies │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json), one object per frame     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: WebSocket text frames (tokio-tungstenite)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message shapes
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | request | `{kind, correlationId?, ...payload}` |
//! | success | `{kind, correlationId, status: "success", state, result, data?}` |
//! | error | `{kind: "error", correlationId, errorCode, message, details?}` |
//! | output | `{kind: "output", executionId, streamTag, seq, bytes, timestamp}` |
//! | state change | `{kind: "state_changed", appId, executionId?, state, exitCode?, timestamp}` |
//!
//! # Usage
//!
//! ```ignore
//! use edgekit_protocol::client::EdgekitClient;
//! use edgekit_protocol::message::Request;
//!
//! let mut client = EdgekitClient::connect("ws://127.0.0.1:8090/ws").await?;
//! let reply = client.request(Request::get_status("app-1")).await?;
//! ```

pub mod client;
pub mod message;

pub use client::{ClientError, EdgekitClient, Reply};
pub use message::{
    AppKind, AppState, AppSummary, Envelope, ErrorCode, ErrorResponse, LifecycleAction, Request,
    RequestKind, ServerMessage, StreamTag, SuccessResponse,
};
