// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request handlers.
//!
//! Each handler turns one decoded request into a [`SuccessResponse`] or an
//! engine [`Error`]. Routing and delivery live in [`crate::server`].

use edgekit_protocol::message::{
    AppTarget, InstallRequest, ListRequest, OutputTarget, RequestKind, SuccessResponse,
    WriteInputRequest,
};
use serde_json::json;
use tracing::debug;

use crate::clients::ClientHandle;
use crate::engine::{Engine, PreparedAction};
use crate::error::{Error, Result};

type CorrelationId = Option<String>;

fn to_data<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("failed to encode response: {}", e)))
}

pub async fn handle_install(
    engine: &Engine,
    correlation_id: CorrelationId,
    request: InstallRequest,
) -> Result<SuccessResponse> {
    let record = engine.install(request).await?;
    Ok(SuccessResponse::new(
        RequestKind::Install,
        correlation_id,
        Some(record.state),
        format!("Application {} installed", record.canonical_id),
    )
    .with_data(to_data(&record.summary())?))
}

/// Run a lifecycle action whose queue position was reserved by the caller.
pub async fn handle_lifecycle(
    engine: &Engine,
    kind: RequestKind,
    correlation_id: CorrelationId,
    prepared: PreparedAction,
) -> Result<SuccessResponse> {
    let outcome = engine.execute(prepared).await?;
    Ok(SuccessResponse::new(
        kind,
        correlation_id,
        Some(outcome.state),
        outcome.summary(),
    )
    .with_data(json!({
        "appId": outcome.app_id,
        "executionId": outcome.execution_id,
    })))
}

pub fn handle_get_status(
    engine: &Engine,
    correlation_id: CorrelationId,
    target: &AppTarget,
) -> Result<SuccessResponse> {
    let record = engine.status(&target.app_id)?;
    Ok(SuccessResponse::new(
        RequestKind::GetStatus,
        correlation_id,
        Some(record.state),
        format!("Application {} is {}", record.canonical_id, record.state),
    )
    .with_data(to_data(&record.summary())?))
}

pub fn handle_list(
    engine: &Engine,
    correlation_id: CorrelationId,
    request: &ListRequest,
) -> Result<SuccessResponse> {
    let summaries: Vec<_> = engine
        .list(request.state)
        .iter()
        .map(|r| r.summary())
        .collect();
    Ok(SuccessResponse::new(
        RequestKind::List,
        correlation_id,
        None,
        format!("{} applications", summaries.len()),
    )
    .with_data(to_data(&summaries)?))
}

pub fn handle_runtime_info(engine: &Engine, correlation_id: CorrelationId) -> Result<SuccessResponse> {
    let info = engine.runtime_info();
    Ok(SuccessResponse::new(
        RequestKind::RuntimeInfo,
        correlation_id,
        None,
        format!("{} {}", info.runtime_name, info.version),
    )
    .with_data(to_data(&info)?))
}

pub fn handle_subscribe_output(
    engine: &Engine,
    client: &ClientHandle,
    correlation_id: CorrelationId,
    target: &OutputTarget,
) -> Result<SuccessResponse> {
    let info = engine.subscribe_output(client, target)?;
    Ok(SuccessResponse::new(
        RequestKind::SubscribeOutput,
        correlation_id,
        None,
        format!("Subscribed to {}", info.execution_id),
    )
    .with_data(to_data(&info)?))
}

pub fn handle_unsubscribe_output(
    engine: &Engine,
    client: &ClientHandle,
    correlation_id: CorrelationId,
    target: &OutputTarget,
) -> Result<SuccessResponse> {
    let (execution_id, removed) = engine.unsubscribe_output(client.id, target)?;
    let result = if removed {
        format!("Unsubscribed from {}", execution_id)
    } else {
        format!("Not subscribed to {}", execution_id)
    };
    Ok(SuccessResponse::new(
        RequestKind::UnsubscribeOutput,
        correlation_id,
        None,
        result,
    )
    .with_data(json!({ "executionId": execution_id })))
}

/// Forward stdin bytes. Never answered, so failures are only logged by the
/// caller.
pub async fn handle_write_input(engine: &Engine, request: &WriteInputRequest) -> Result<()> {
    let bytes = request.bytes().map_err(Error::Validation)?;
    engine.write_input(&request.target, &bytes).await?;
    debug!(bytes = bytes.len(), "Forwarded input");
    Ok(())
}
