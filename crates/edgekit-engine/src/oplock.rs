// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application operation lock.
//!
//! A ticket queue per canonical id. Taking a [`Ticket`] is synchronous and
//! fixes the caller's position, so operations on one application run in
//! the order their tickets were issued even when the tasks that await them
//! are scheduled out of order. At most `max_pending` tickets may wait
//! behind the one being served; further callers are refused with
//! `OperationInProgress`. Different applications never share a queue.
//!
//! Backend events take unbounded tickets: a process exit must never be
//! refused.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Slot {
    queue: Mutex<Queue>,
    /// Ticket number currently being served.
    serving: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct Queue {
    next: u64,
    /// Tickets dropped before their turn.
    abandoned: BTreeSet<u64>,
}

impl Slot {
    fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            queue: Mutex::new(Queue::default()),
            serving,
        }
    }

    /// Move to the next live ticket. Caller holds `queue`.
    fn advance(&self, queue: &mut Queue) {
        let mut next = *self.serving.borrow() + 1;
        while queue.abandoned.remove(&next) {
            next += 1;
        }
        self.serving.send_replace(next);
    }

    fn outstanding(&self, queue: &Queue) -> u64 {
        queue.next - *self.serving.borrow()
    }
}

/// Ticket queues for all applications.
#[derive(Debug)]
pub struct OperationLocks {
    max_pending: usize,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl OperationLocks {
    /// `max_pending` operations may wait behind the running one.
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, app_id: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn issue(&self, app_id: &str, bounded: bool) -> Result<Ticket> {
        let slot = self.slot(app_id);
        let number = {
            let mut queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if bounded && slot.outstanding(&queue) > self.max_pending as u64 {
                return Err(Error::OperationInProgress(app_id.to_string()));
            }
            let number = queue.next;
            queue.next += 1;
            number
        };
        trace!(app_id = %app_id, ticket = number, "Operation ticket issued");
        Ok(Ticket {
            app_id: app_id.to_string(),
            slot: Some(slot),
            number,
        })
    }

    /// Take a place in `app_id`'s queue, or fail if it is full.
    pub fn reserve(&self, app_id: &str) -> Result<Ticket> {
        self.issue(app_id, true)
    }

    /// Take a place in `app_id`'s queue regardless of its length.
    pub fn reserve_unbounded(&self, app_id: &str) -> Ticket {
        match self.issue(app_id, false) {
            Ok(ticket) => ticket,
            Err(_) => unreachable!("unbounded tickets are never refused"),
        }
    }

    /// Run `f` with exclusive access to `app_id`.
    pub async fn with_lock<F, Fut, T>(&self, app_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.reserve(app_id)?.acquire().await;
        let result = f().await;
        drop(guard);
        Ok(result)
    }

    /// True while an operation holds or waits for `app_id`.
    pub fn is_busy(&self, app_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(app_id).is_some_and(|slot| {
            let queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
            slot.outstanding(&queue) > 0
        })
    }

    /// Drop the queue of a removed application once only the caller's own
    /// turn is left on it. A queue with waiters is kept, so tickets issued
    /// for a later installation under the same id still line up behind them.
    pub fn forget(&self, app_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = slots.get(app_id).is_some_and(|slot| {
            let queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
            slot.outstanding(&queue) <= 1
        });
        if idle {
            slots.remove(app_id);
        }
    }
}

/// A position in one application's queue.
///
/// Dropping a ticket before acquiring it gives the position up.
#[derive(Debug)]
pub struct Ticket {
    app_id: String,
    slot: Option<Arc<Slot>>,
    number: u64,
}

impl Ticket {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Wait for this ticket's turn.
    ///
    /// Cancel safe: dropping the future gives the position up.
    pub async fn acquire(mut self) -> OperationGuard {
        let Some(slot) = self.slot.clone() else {
            unreachable!("ticket acquired twice");
        };
        let mut serving = slot.serving.subscribe();
        // The sender lives in `slot`, which we hold, so this cannot fail.
        let _ = serving.wait_for(|n| *n == self.number).await;
        // The turn now belongs to the guard.
        self.slot = None;
        trace!(app_id = %self.app_id, ticket = self.number, "Operation lock acquired");
        OperationGuard {
            app_id: std::mem::take(&mut self.app_id),
            slot,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if *slot.serving.borrow() == self.number {
                slot.advance(&mut queue);
            } else {
                queue.abandoned.insert(self.number);
            }
        }
    }
}

/// Exclusive access to one application until dropped.
#[derive(Debug)]
pub struct OperationGuard {
    app_id: String,
    slot: Arc<Slot>,
}

impl OperationGuard {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut queue = self.slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
        self.slot.advance(&mut queue);
        trace!(app_id = %self.app_id, "Operation lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_queue_rejects_third_caller() {
        let locks = OperationLocks::new(1);
        let first = locks.reserve("a").unwrap();
        let _second = locks.reserve("a").unwrap();
        assert!(matches!(
            locks.reserve("a"),
            Err(Error::OperationInProgress(_))
        ));

        // Other applications are unaffected
        let _other = locks.reserve("b").unwrap();

        // Once the first finishes there is room again
        drop(first.acquire().await);
        assert!(locks.reserve("a").is_ok());
    }

    #[tokio::test]
    async fn test_zero_pending_rejects_while_busy() {
        let locks = OperationLocks::new(0);
        let guard = locks.reserve("a").unwrap().acquire().await;
        assert!(locks.is_busy("a"));
        assert!(locks.reserve("a").is_err());
        drop(guard);
        assert!(!locks.is_busy("a"));
        assert!(locks.reserve("a").is_ok());
    }

    #[tokio::test]
    async fn test_tickets_run_in_issue_order() {
        let locks = Arc::new(OperationLocks::new(8));
        let order = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<Ticket> = (0..4).map(|_| locks.reserve("a").unwrap()).collect();
        let mut handles = Vec::new();
        // Spawn in reverse so scheduling order disagrees with ticket order
        for (i, ticket) in tickets.into_iter().enumerate().rev() {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = ticket.acquire().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abandoned_ticket_is_skipped() {
        let locks = OperationLocks::new(4);
        let first = locks.reserve("a").unwrap();
        let second = locks.reserve("a").unwrap();
        let third = locks.reserve("a").unwrap();

        drop(second);
        drop(first.acquire().await);

        let guard = tokio::time::timeout(Duration::from_secs(1), third.acquire())
            .await
            .expect("third ticket should be served");
        drop(guard);
        assert!(!locks.is_busy("a"));
    }

    #[tokio::test]
    async fn test_dropping_current_ticket_passes_turn() {
        let locks = OperationLocks::new(4);
        let first = locks.reserve("a").unwrap();
        let second = locks.reserve("a").unwrap();
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second.acquire())
            .await
            .expect("second ticket should be served");
    }

    #[tokio::test]
    async fn test_cancelled_acquire_gives_position_up() {
        let locks = OperationLocks::new(4);
        let guard = locks.reserve("a").unwrap().acquire().await;
        let second = locks.reserve("a").unwrap();
        let third = locks.reserve("a").unwrap();

        // Second gives up while still waiting
        let waited = tokio::time::timeout(Duration::from_millis(20), second.acquire()).await;
        assert!(waited.is_err());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), third.acquire())
            .await
            .expect("third ticket should be served");
    }

    #[tokio::test]
    async fn test_unbounded_never_refused() {
        let locks = OperationLocks::new(0);
        let _guard = locks.reserve("a").unwrap().acquire().await;
        let _t1 = locks.reserve_unbounded("a");
        let _t2 = locks.reserve_unbounded("a");
        assert!(locks.reserve("a").is_err());
    }

    #[tokio::test]
    async fn test_with_lock_excludes_concurrent_callers() {
        let locks = Arc::new(OperationLocks::new(16));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("a", || async {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_forget_keeps_queue_with_waiters() {
        let locks = OperationLocks::new(4);
        let guard = locks.reserve("a").unwrap().acquire().await;
        let waiting = locks.reserve("a").unwrap();

        locks.forget("a");
        // A new ticket queues behind the waiter instead of on a fresh slot
        let later = locks.reserve("a").unwrap();
        drop(guard);

        let later = tokio::spawn(later.acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!later.is_finished());

        drop(waiting);
        tokio::time::timeout(Duration::from_secs(1), later)
            .await
            .expect("later ticket should be served")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forget_drops_idle_queue() {
        let locks = OperationLocks::new(0);
        let guard = locks.reserve("a").unwrap().acquire().await;
        locks.forget("a");
        assert!(!locks.is_busy("a"));
        drop(guard);
    }

    #[tokio::test]
    async fn test_different_apps_run_in_parallel() {
        let locks = OperationLocks::new(0);
        let _a = locks.reserve("a").unwrap().acquire().await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.reserve("b").unwrap().acquire(),
        )
        .await;
        assert!(b.is_ok());
    }
}
