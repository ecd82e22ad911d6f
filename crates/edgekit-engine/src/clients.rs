// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session manager: live client connections and their pending requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use edgekit_protocol::message::{RequestKind, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::output::ChunkQueue;

/// Connection-scoped client id.
pub type ClientId = u64;

/// One connected client.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    /// Responses and notifications, never dropped.
    outbound: mpsc::UnboundedSender<ServerMessage>,
    /// Output chunks, oldest dropped when full.
    pub output: Arc<ChunkQueue>,
    pub connected_at: DateTime<Utc>,
}

impl ClientHandle {
    /// Queue a message for this client. False once it has disconnected.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// A request awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: Option<String>,
    pub client_id: ClientId,
    pub kind: RequestKind,
    pub deadline: Instant,
}

/// Opaque key of a [`PendingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey(u64);

/// Live clients and their pending requests.
#[derive(Debug)]
pub struct ClientRegistry {
    next_client: AtomicU64,
    next_request: AtomicU64,
    queue_len: usize,
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    pending: Mutex<HashMap<PendingKey, PendingRequest>>,
}

impl ClientRegistry {
    /// `queue_len` bounds each client's output queue.
    pub fn new(queue_len: usize) -> Self {
        Self {
            next_client: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            queue_len,
            clients: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new connection. The receiver carries responses and
    /// notifications for it.
    pub fn connect(&self) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            outbound: tx,
            output: Arc::new(ChunkQueue::new(self.queue_len)),
            connected_at: Utc::now(),
        });
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id, handle.clone());
        (handle, rx)
    }

    /// Forget a connection and everything it was waiting for.
    pub fn disconnect(&self, client_id: ClientId) -> Option<Arc<ClientHandle>> {
        let handle = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id)?;
        handle.output.close();

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let before = pending.len();
        pending.retain(|_, p| p.client_id != client_id);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(client_id, dropped, "Discarded pending requests of disconnected client");
        }
        Some(handle)
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_id)
            .cloned()
    }

    /// Send to a client if it is still connected.
    pub fn send(&self, client_id: ClientId, message: ServerMessage) -> bool {
        self.get(client_id).is_some_and(|c| c.send(message))
    }

    pub fn connected(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Record a request that will be answered later.
    pub fn register_pending(&self, request: PendingRequest) -> PendingKey {
        let key = PendingKey(self.next_request.fetch_add(1, Ordering::Relaxed));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, request);
        key
    }

    /// Take a pending request out. `None` if it was already answered,
    /// timed out, or its client left.
    pub fn complete(&self, key: PendingKey) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
    }

    /// Deliver the answer to a pending request. Late answers are dropped.
    pub fn respond(&self, key: PendingKey, message: ServerMessage) -> bool {
        match self.complete(key) {
            Some(pending) => self.send(pending.client_id, message),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
