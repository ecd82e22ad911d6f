// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state machine.
//!
//! Pure decision functions: nothing here touches the registry or the
//! backend. Callers hold the application's operation lock while applying
//! the result.
//!
//! ```text
//!   installed ──start──► starting ──► running ◄──► pausing ──► paused
//!                            ▲          │  ▲                    │  │
//!                            │          │  └──── resuming ◄─────┘  │
//!                            │        stop                        stop
//!                            │          ▼                          │
//!   stopped / error ──start/restart─► stopping ──► stopped ◄───────┘
//!        │
//!      remove ──► uninstalling ──► (removed)
//! ```
//!
//! Any backend failure during a transition lands in `error`.

use std::fmt;

use edgekit_protocol::message::{AppState, LifecycleAction};

/// An accepted action: the state published while the backend works, and
/// the state committed once it acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: LifecycleAction,
    pub from: AppState,
    pub intermediate: AppState,
    pub target: AppState,
}

/// A refused action, with the actions that would have been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub state: AppState,
    pub action: LifecycleAction,
    pub allowed: Vec<LifecycleAction>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allowed: Vec<&str> = self.allowed.iter().map(LifecycleAction::as_str).collect();
        write!(
            f,
            "cannot {} an application in state {} (allowed: [{}])",
            self.action,
            self.state,
            allowed.join(", ")
        )
    }
}

/// Decide whether `action` is legal from `state`.
pub fn plan(state: AppState, action: LifecycleAction) -> Result<Transition, Rejection> {
    use AppState as S;
    use LifecycleAction as A;

    let (intermediate, target) = match (state, action) {
        (S::Installed | S::Stopped | S::Error, A::Start) => (S::Starting, S::Running),
        (S::Running | S::Paused | S::Error, A::Stop) => (S::Stopping, S::Stopped),
        (S::Running, A::Pause) => (S::Pausing, S::Paused),
        (S::Paused, A::Resume) => (S::Resuming, S::Running),
        (S::Running | S::Paused | S::Stopped | S::Error, A::Restart) => (S::Starting, S::Running),
        (S::Stopped | S::Error, A::Remove) => (S::Uninstalling, S::Removed),
        _ => {
            return Err(Rejection {
                state,
                action,
                allowed: allowed_actions(state),
            });
        }
    };

    Ok(Transition {
        action,
        from: state,
        intermediate,
        target,
    })
}

/// Actions accepted from `state`, in table order.
pub fn allowed_actions(state: AppState) -> Vec<LifecycleAction> {
    use AppState as S;
    use LifecycleAction as A;

    match state {
        S::Installed => vec![A::Start],
        S::Running => vec![A::Stop, A::Pause, A::Restart],
        S::Paused => vec![A::Stop, A::Resume, A::Restart],
        S::Stopped => vec![A::Start, A::Restart, A::Remove],
        S::Error => vec![A::Start, A::Stop, A::Restart, A::Remove],
        S::Starting
        | S::Pausing
        | S::Resuming
        | S::Stopping
        | S::Uninstalling
        | S::Removed => Vec::new(),
    }
}

/// State an execution lands in when it ends: a clean exit stops the
/// application, anything else (non-zero code, killed by signal) is an error.
pub fn exit_state(exit_code: Option<i32>) -> AppState {
    match exit_code {
        Some(0) => AppState::Stopped,
        _ => AppState::Error,
    }
}

/// Transition caused by the backend reporting that the execution ended.
///
/// Returns `None` when the application is not in a state that owns a live
/// execution, in which case the event is stale and only closes the session.
pub fn on_terminated(state: AppState, exit_code: Option<i32>) -> Option<AppState> {
    match state {
        AppState::Running | AppState::Pausing | AppState::Paused | AppState::Resuming => {
            Some(exit_state(exit_code))
        }
        _ => None,
    }
}

/// Whether a record in `state` must, may, or must not carry an execution
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePresence {
    Required,
    /// Only while the backend call that creates or destroys it is in flight.
    Optional,
    Forbidden,
}

pub fn handle_presence(state: AppState) -> HandlePresence {
    match state {
        AppState::Running | AppState::Pausing | AppState::Paused | AppState::Resuming => {
            HandlePresence::Required
        }
        AppState::Starting | AppState::Stopping => HandlePresence::Optional,
        AppState::Installed
        | AppState::Stopped
        | AppState::Error
        | AppState::Uninstalling
        | AppState::Removed => HandlePresence::Forbidden,
    }
}

/// Check a (state, has_handle) pair against [`handle_presence`].
pub fn handle_consistent(state: AppState, has_handle: bool) -> bool {
    match handle_presence(state) {
        HandlePresence::Required => has_handle,
        HandlePresence::Optional => true,
        HandlePresence::Forbidden => !has_handle,
    }
}
