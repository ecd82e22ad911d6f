// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket server and message router.
//!
//! One task per connection reads frames, decodes them and routes each
//! request. Lifecycle requests reserve their queue position inside the read
//! loop and then run on their own task, so a slow backend never blocks the
//! connection. Everything sent to the client (responses, notifications,
//! output) is written by the same connection task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use edgekit_protocol::message::{
    Envelope, ErrorCode, ErrorResponse, LifecycleAction, Request, RequestKind, ServerMessage,
    SuccessResponse, WriteInputRequest,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clients::{ClientHandle, PendingRequest};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handlers::{
    handle_get_status, handle_install, handle_lifecycle, handle_list, handle_runtime_info,
    handle_subscribe_output, handle_unsubscribe_output, handle_write_input,
};

/// Shared state of the WebSocket server.
pub struct ServerState {
    pub engine: Arc<Engine>,
    /// Deadline for a response to a deferred request.
    pub request_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ServerState {
    pub fn new(engine: Arc<Engine>, request_timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            request_timeout,
            shutdown,
        }
    }
}

/// Axum router exposing the control channel at `/ws`.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(state)
}

/// Serve connections until the shutdown signal flips to `true`.
pub async fn run_server(listener: TcpListener, state: Arc<ServerState>) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let mut shutdown = state.shutdown.clone();

    info!(addr = %addr, "WebSocket server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await?;

    info!("WebSocket server stopped");
    Ok(())
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, state))
}

async fn client_loop(mut socket: WebSocket, state: Arc<ServerState>) {
    let engine = state.engine.clone();
    let (client, mut outbound) = engine.clients().connect();
    let mut shutdown = state.shutdown.clone();

    // Input writes of one connection are forwarded in order.
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_input(engine.clone(), input_rx));

    info!(client_id = client.id, "Client connected");

    loop {
        tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => break,

            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if !send_message(&mut socket, &message).await {
                    break;
                }
            }

            chunk = client.output.pop() => {
                let Some(chunk) = chunk else {
                    break;
                };
                let message = ServerMessage::Output(chunk.as_ref().clone());
                if !send_message(&mut socket, &message).await {
                    break;
                }
            }

            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else {
                    break;
                };

                match frame {
                    Message::Text(text) => dispatch(&state, &client, &input_tx, text.as_str()),
                    Message::Binary(_) => {
                        client.send(
                            ErrorResponse::new(
                                None,
                                ErrorCode::ValidationError,
                                "binary frames are not supported",
                            )
                            .into(),
                        );
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    engine.disconnect(client.id);
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match message.encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to encode outbound message");
            true
        }
    }
}

async fn forward_input(engine: Arc<Engine>, mut requests: mpsc::UnboundedReceiver<WriteInputRequest>) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = handle_write_input(&engine, &request).await {
            warn!(
                execution_id = ?request.target.execution_id,
                app_id = ?request.target.app_id,
                error = %e,
                "Dropped input"
            );
        }
    }
}

/// Decode one text frame and route it.
fn dispatch(
    state: &Arc<ServerState>,
    client: &Arc<ClientHandle>,
    input: &mpsc::UnboundedSender<WriteInputRequest>,
    text: &str,
) {
    let Envelope {
        correlation_id,
        request,
    } = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(client_id = client.id, error = %e, "Rejected inbound frame");
            client.send(e.into_response().into());
            return;
        }
    };

    let kind = request.kind();
    debug!(
        client_id = client.id,
        kind = %kind,
        correlation_id = ?correlation_id,
        "Received request"
    );

    let engine = &state.engine;
    let cid = correlation_id.clone();
    let result = match request {
        Request::Install(request) => {
            let engine = engine.clone();
            defer(state, client, kind, correlation_id, async move {
                handle_install(&engine, cid, request).await
            });
            return;
        }

        Request::Start(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Start, &target.app_id);
        }
        Request::Stop(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Stop, &target.app_id);
        }
        Request::Pause(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Pause, &target.app_id);
        }
        Request::Resume(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Resume, &target.app_id);
        }
        Request::Restart(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Restart, &target.app_id);
        }
        Request::Remove(target) => {
            return lifecycle(state, client, kind, correlation_id, LifecycleAction::Remove, &target.app_id);
        }

        Request::GetStatus(target) => handle_get_status(engine, cid, &target),
        Request::List(request) => handle_list(engine, cid, &request),
        Request::RuntimeInfo => handle_runtime_info(engine, cid),
        Request::SubscribeOutput(target) => handle_subscribe_output(engine, client, cid, &target),
        Request::UnsubscribeOutput(target) => {
            handle_unsubscribe_output(engine, client, cid, &target)
        }

        Request::WriteInput(request) => {
            let _ = input.send(request);
            return;
        }
    };

    client.send(into_message(kind, correlation_id, result));
}

/// Reserve the queue position now, run the action later.
fn lifecycle(
    state: &Arc<ServerState>,
    client: &Arc<ClientHandle>,
    kind: RequestKind,
    correlation_id: Option<String>,
    action: LifecycleAction,
    app_id: &str,
) {
    match state.engine.prepare(action, app_id) {
        Ok(prepared) => {
            let engine = state.engine.clone();
            let cid = correlation_id.clone();
            defer(state, client, kind, correlation_id, async move {
                handle_lifecycle(&engine, kind, cid, prepared).await
            });
        }
        Err(e) => {
            client.send(into_message(kind, correlation_id, Err(e)));
        }
    }
}

/// Run `op` on its own task and answer when it finishes or the request
/// deadline passes, whichever comes first. A timed-out operation keeps
/// running; its eventual result is dropped.
fn defer<F>(
    state: &Arc<ServerState>,
    client: &Arc<ClientHandle>,
    kind: RequestKind,
    correlation_id: Option<String>,
    op: F,
) where
    F: Future<Output = Result<SuccessResponse>> + Send + 'static,
{
    let engine = state.engine.clone();
    let timeout = state.request_timeout;
    let key = engine.clients().register_pending(PendingRequest {
        correlation_id: correlation_id.clone(),
        client_id: client.id,
        kind,
        deadline: Instant::now() + timeout,
    });

    tokio::spawn(async move {
        let mut task = tokio::spawn(op);

        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined.unwrap_or_else(|e| {
                error!(kind = %kind, "Request handler panicked: {}", e);
                Err(Error::Internal("request handler failed".to_string()))
            }),
            Err(_) => {
                warn!(kind = %kind, correlation_id = ?correlation_id, "Request timed out");
                engine.clients().respond(
                    key,
                    Error::RequestTimeout(timeout)
                        .to_response(correlation_id)
                        .into(),
                );
                match task.await {
                    Ok(Ok(_)) => debug!(kind = %kind, "Timed-out request completed"),
                    Ok(Err(e)) => debug!(kind = %kind, error = %e, "Timed-out request failed"),
                    Err(e) => error!(kind = %kind, "Request handler panicked: {}", e),
                }
                return;
            }
        };

        engine
            .clients()
            .respond(key, into_message(kind, correlation_id, result));
    });
}

fn into_message(
    kind: RequestKind,
    correlation_id: Option<String>,
    result: Result<SuccessResponse>,
) -> ServerMessage {
    match result {
        Ok(response) => response.into(),
        Err(e) => {
            match &e {
                Error::Backend { .. } | Error::Store(_) | Error::Internal(_) => {
                    warn!(kind = %kind, error = %e, "Request failed")
                }
                _ => debug!(kind = %kind, error = %e, "Request rejected"),
            }
            e.to_response(correlation_id).into()
        }
    }
}
