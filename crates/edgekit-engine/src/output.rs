// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output stream multiplexer.
//!
//! Each execution owns an [`OutputBuffer`], a byte-bounded ring of output
//! chunks. Publishing appends to the ring and pushes the chunk to every
//! subscriber's [`ChunkQueue`]. Subscriber queues are bounded and drop
//! their oldest chunk when full, so a slow client only ever loses its own
//! output and the producer never waits.
//!
//! Subscribing replays the ring before any live chunk, under the same lock
//! that publishing takes, so a late joiner sees every chunk still buffered
//! exactly once and in order. The replay is bounded by the ring, not by the
//! subscriber queue, and never evicts live chunks of other executions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use edgekit_protocol::message::{OutputMessage, StreamTag, SubscriptionInfo};
use tokio::sync::Notify;
use tracing::debug;

use crate::clients::ClientId;

/// One buffered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u64,
    pub stream: StreamTag,
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Byte-bounded ring of output chunks.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    chunks: VecDeque<Chunk>,
    size: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::new(),
            size: 0,
            next_seq: 0,
        }
    }

    /// Append a chunk, evicting the oldest ones to stay within capacity.
    /// A chunk larger than the whole buffer keeps only its tail.
    pub fn push(&mut self, stream: StreamTag, bytes: &[u8], timestamp: DateTime<Utc>) -> Chunk {
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        while self.size + bytes.len() > self.capacity {
            match self.chunks.pop_front() {
                Some(old) => self.size -= old.bytes.len(),
                None => break,
            }
        }

        let chunk = Chunk {
            seq: self.next_seq,
            stream,
            bytes: bytes.to_vec(),
            timestamp,
        };
        self.next_seq += 1;
        self.size += chunk.bytes.len();
        self.chunks.push_back(chunk.clone());
        chunk
    }

    /// Buffered chunks, oldest first.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Sequence number of the oldest chunk still buffered (or of the next
    /// one when empty).
    pub fn first_seq(&self) -> u64 {
        self.chunks.front().map_or(self.next_seq, |c| c.seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Buffered history handed over on subscribe, sent before `items`.
    replay: VecDeque<Arc<OutputMessage>>,
    items: VecDeque<Arc<OutputMessage>>,
    dropped: u64,
    closed: bool,
}

/// Bounded per-client queue of outbound output chunks.
///
/// Single consumer. A full queue drops its oldest live chunk; replayed
/// history is kept in full.
#[derive(Debug)]
pub struct ChunkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a chunk. Returns false if an older chunk was dropped to
    /// make room.
    pub fn push(&self, message: Arc<OutputMessage>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return true;
        }
        let mut kept_all = true;
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
            kept_all = false;
        }
        state.items.push_back(message);
        drop(state);
        self.notify.notify_one();
        kept_all
    }

    /// Enqueue replayed history ahead of live chunks.
    pub fn push_replay(&self, messages: impl IntoIterator<Item = Arc<OutputMessage>>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.replay.extend(messages);
        drop(state);
        self.notify.notify_one();
    }

    /// Next chunk, waiting if the queue is empty. `None` once closed.
    pub async fn pop(&self) -> Option<Arc<OutputMessage>> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(message) = state.replay.pop_front().or_else(|| state.items.pop_front()) {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting chunks and wake the consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.replay.clear();
        state.items.clear();
        drop(state);
        self.notify.notify_one();
    }

    /// Chunks dropped because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).dropped
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.replay.len() + state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Stream {
    buffer: OutputBuffer,
    subscribers: HashMap<ClientId, Arc<ChunkQueue>>,
    ended: bool,
}

/// Fans execution output out to subscribed clients.
#[derive(Debug)]
pub struct OutputMultiplexer {
    buffer_capacity: usize,
    streams: Mutex<HashMap<String, Stream>>,
}

impl OutputMultiplexer {
    /// `buffer_capacity` bytes are kept per execution.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the buffer for a new execution.
    pub fn open(&self, execution_id: &str) {
        self.streams()
            .entry(execution_id.to_string())
            .or_insert_with(|| Stream {
                buffer: OutputBuffer::new(self.buffer_capacity),
                subscribers: HashMap::new(),
                ended: false,
            });
    }

    /// Mark an execution as finished. Its buffer stays until discarded.
    pub fn end(&self, execution_id: &str) {
        if let Some(stream) = self.streams().get_mut(execution_id) {
            stream.ended = true;
        }
    }

    /// Drop an execution's buffer and subscriptions.
    pub fn discard(&self, execution_id: &str) -> bool {
        self.streams().remove(execution_id).is_some()
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.streams().contains_key(execution_id)
    }

    /// Append output and push it to every subscriber. Returns the chunk's
    /// sequence number, or `None` for an unknown execution.
    pub fn publish(&self, execution_id: &str, stream_tag: StreamTag, bytes: &[u8]) -> Option<u64> {
        let mut streams = self.streams();
        let stream = streams.get_mut(execution_id)?;
        let chunk = stream.buffer.push(stream_tag, bytes, Utc::now());

        if !stream.subscribers.is_empty() {
            let message = Arc::new(to_message(execution_id, &chunk));
            for (client_id, queue) in &stream.subscribers {
                if !queue.push(message.clone()) {
                    debug!(
                        execution_id = %execution_id,
                        client_id = client_id,
                        "Subscriber queue full, dropped oldest chunk"
                    );
                }
            }
        }
        Some(chunk.seq)
    }

    /// Subscribe `client_id` to an execution.
    ///
    /// Buffered chunks are handed over first, then live ones follow.
    /// Subscribing twice is a no-op that reports the current position.
    pub fn subscribe(
        &self,
        execution_id: &str,
        client_id: ClientId,
        queue: Arc<ChunkQueue>,
    ) -> Option<SubscriptionInfo> {
        let mut streams = self.streams();
        let stream = streams.get_mut(execution_id)?;

        if stream.subscribers.contains_key(&client_id) {
            return Some(SubscriptionInfo {
                execution_id: execution_id.to_string(),
                cursor: stream.buffer.next_seq(),
                replayed: 0,
            });
        }

        let cursor = stream.buffer.first_seq();
        let replayed = stream.buffer.len();
        queue.push_replay(
            stream
                .buffer
                .chunks()
                .map(|chunk| Arc::new(to_message(execution_id, chunk))),
        );
        stream.subscribers.insert(client_id, queue);

        Some(SubscriptionInfo {
            execution_id: execution_id.to_string(),
            cursor,
            replayed,
        })
    }

    pub fn unsubscribe(&self, execution_id: &str, client_id: ClientId) -> bool {
        self.streams()
            .get_mut(execution_id)
            .is_some_and(|s| s.subscribers.remove(&client_id).is_some())
    }

    /// Remove every subscription of a client. Buffers are untouched.
    pub fn unsubscribe_all(&self, client_id: ClientId) -> usize {
        let mut removed = 0;
        for stream in self.streams().values_mut() {
            if stream.subscribers.remove(&client_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Clients subscribed to an execution.
    pub fn subscribers_of(&self, execution_id: &str) -> Vec<ClientId> {
        self.streams()
            .get(execution_id)
            .map(|s| s.subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Bytes currently buffered across all executions.
    pub fn buffered_bytes(&self) -> usize {
        self.streams().values().map(|s| s.buffer.size()).sum()
    }

    /// Memory reserved by executions that may still produce output.
    pub fn reserved_bytes(&self) -> usize {
        self.streams()
            .values()
            .filter(|s| !s.ended)
            .map(|s| s.buffer.capacity())
            .sum()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

fn to_message(execution_id: &str, chunk: &Chunk) -> OutputMessage {
    OutputMessage::new(
        execution_id,
        chunk.stream,
        chunk.seq,
        &chunk.bytes,
        chunk.timestamp,
    )
}
