// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket client for the edgekit control channel.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument};

use crate::message::{Envelope, ErrorResponse, Request, RequestKind, ServerMessage, SuccessResponse};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("{0} requests are never answered")]
    NoReply(RequestKind),
}

/// Outcome of a request: the engine answered either way.
pub type Reply = std::result::Result<SuccessResponse, ErrorResponse>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single connection to the engine.
///
/// Frames that arrive while waiting for a particular reply (other replies,
/// output chunks, state notifications) are kept in a backlog and handed
/// out by later calls, so nothing read off the socket is lost.
pub struct EdgekitClient {
    socket: Socket,
    backlog: VecDeque<ServerMessage>,
    id_prefix: String,
    next_id: u64,
    read_timeout: Duration,
}

impl EdgekitClient {
    /// Connect to `url`, e.g. `ws://127.0.0.1:8090/ws`.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _response) = connect_async(url).await?;
        debug!("connected to edgekit engine");

        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            socket,
            backlog: VecDeque::new(),
            id_prefix: id[..8].to_string(),
            next_id: 1,
            read_timeout: Duration::from_secs(10),
        })
    }

    /// Set how long reads wait before failing with [`ClientError::Timeout`].
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("{}-{}", self.id_prefix, self.next_id);
        self.next_id += 1;
        id
    }

    /// Send a request under a fresh correlation id and return that id.
    pub async fn send(&mut self, request: Request) -> Result<String, ClientError> {
        let id = self.allocate_id();
        self.send_with_id(Some(id.clone()), request).await?;
        Ok(id)
    }

    /// Send a request with an explicit (possibly absent) correlation id.
    pub async fn send_with_id(
        &mut self,
        correlation_id: Option<String>,
        request: Request,
    ) -> Result<(), ClientError> {
        let text = Envelope::new(correlation_id, request).encode()?;
        self.send_raw(&text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.socket.send(Message::text(text.to_string())).await?;
        Ok(())
    }

    /// Send a request and wait for its reply.
    pub async fn request(&mut self, request: Request) -> Result<Reply, ClientError> {
        let kind = request.kind();
        if kind.is_fire_and_forget() {
            return Err(ClientError::NoReply(kind));
        }
        let id = self.send(request).await?;
        self.wait_reply(&id).await
    }

    /// Wait for the reply carrying `correlation_id`.
    pub async fn wait_reply(&mut self, correlation_id: &str) -> Result<Reply, ClientError> {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|m| m.correlation_id() == Some(correlation_id))
            && let Some(message) = self.backlog.remove(pos)
        {
            return Ok(into_reply(message));
        }

        loop {
            let message = self.read_message().await?;
            if message.correlation_id() == Some(correlation_id) {
                return Ok(into_reply(message));
            }
            self.backlog.push_back(message);
        }
    }

    /// Next output or state-change notification.
    pub async fn next_unsolicited(&mut self) -> Result<ServerMessage, ClientError> {
        if let Some(pos) = self.backlog.iter().position(ServerMessage::is_unsolicited)
            && let Some(message) = self.backlog.remove(pos)
        {
            return Ok(message);
        }

        loop {
            let message = self.read_message().await?;
            if message.is_unsolicited() {
                return Ok(message);
            }
            self.backlog.push_back(message);
        }
    }

    /// Next frame of any kind, oldest first.
    pub async fn next_message(&mut self) -> Result<ServerMessage, ClientError> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(message);
        }
        self.read_message().await
    }

    async fn read_message(&mut self) -> Result<ServerMessage, ClientError> {
        loop {
            let frame = tokio::time::timeout(self.read_timeout, self.socket.next())
                .await
                .map_err(|_| ClientError::Timeout(self.read_timeout))?;

            match frame {
                Some(Ok(Message::Text(text))) => return Ok(ServerMessage::decode(text.as_str())?),
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.socket.close(None).await?;
        Ok(())
    }
}

fn into_reply(message: ServerMessage) -> Reply {
    match message {
        ServerMessage::Success(r) => Ok(r),
        ServerMessage::Error(e) => Err(e),
        // Unsolicited messages never carry a correlation id.
        ServerMessage::Output(_) | ServerMessage::StateChanged(_) => Err(ErrorResponse::new(
            None,
            crate::message::ErrorCode::InternalError,
            "unexpected unsolicited message",
        )),
    }
}
