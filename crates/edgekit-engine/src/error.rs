// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgekit-engine.
//!
//! Every variant maps to one stable wire [`ErrorCode`]. Handlers never let
//! an [`Error`] escape the connection: it is turned into an error response
//! with [`Error::to_response`].

use std::time::Duration;

use edgekit_protocol::message::{ErrorCode, ErrorResponse, TransitionDetails};
use thiserror::Error;

use crate::backend::BackendError;
use crate::lifecycle::Rejection;
use crate::store::StoreError;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No application for the given identifier.
    #[error("Application not found: {0}")]
    NotFound(String),

    /// Action not permitted from the current state.
    #[error("Invalid transition for {app_id}: {rejection}")]
    InvalidTransition { app_id: String, rejection: Rejection },

    /// Another mutating operation is active and the queue is full.
    #[error("Operation already in progress for {0}")]
    OperationInProgress(String),

    /// Identifier suffixes exhausted.
    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    /// The execution backend failed.
    #[error("Backend error for {app_id}: {source}")]
    Backend {
        app_id: String,
        #[source]
        source: BackendError,
    },

    /// Global admission limit reached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Unknown request kind.
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(String),

    /// Malformed request payload.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No response within the request deadline.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Other error.
    #[error("{0}")]
    Internal(String),
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a backend failure for `app_id`.
    pub fn backend(app_id: impl Into<String>, source: BackendError) -> Self {
        Error::Backend {
            app_id: app_id.into(),
            source,
        }
    }

    /// Stable wire code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::OperationInProgress(_) => ErrorCode::OperationInProgress,
            Error::DuplicateIdentifier(_) => ErrorCode::DuplicateIdentifier,
            Error::Backend { .. } => ErrorCode::BackendError,
            Error::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            Error::UnknownMessageKind(_) => ErrorCode::UnknownMessageKind,
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::RequestTimeout(_) => ErrorCode::RequestTimeout,
            Error::Store(_) | Error::Config(_) | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Structured details for the error response, if any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::InvalidTransition { rejection, .. } => serde_json::to_value(TransitionDetails {
                current_state: rejection.state,
                requested_action: rejection.action,
                allowed_actions: rejection.allowed.clone(),
            })
            .ok(),
            Error::Backend { app_id, .. } => Some(serde_json::json!({ "appId": app_id })),
            _ => None,
        }
    }

    /// Build the error response answering the request `correlation_id`.
    pub fn to_response(&self, correlation_id: Option<String>) -> ErrorResponse {
        let response = ErrorResponse::new(correlation_id, self.error_code(), self.to_string());
        match self.details() {
            Some(details) => response.with_details(details),
            None => response,
        }
    }
}
