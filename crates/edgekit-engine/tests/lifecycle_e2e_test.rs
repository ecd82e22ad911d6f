// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end lifecycle tests over the WebSocket control channel.

mod common;

use std::time::Duration;

use common::{TestContext, next_state_change};
use edgekit_protocol::message::{
    AppState, ErrorCode, LifecycleAction, OutputTarget, Request, ServerMessage, StreamTag,
    SubscriptionInfo,
};

#[tokio::test]
async fn test_full_lifecycle() {
    let mut ctx = TestContext::new().await;
    let app_id = ctx.install("X").await;
    assert_eq!(app_id, "X");
    assert_eq!(ctx.status("X").await.state, AppState::Installed);

    let response = ctx.ok(Request::start("X")).await;
    assert_eq!(response.state, Some(AppState::Running));
    let execution_id = ctx.status("X").await.execution_id.unwrap();
    assert_eq!(ctx.backend.live_executions().await, vec![execution_id.clone()]);

    let response = ctx.ok(Request::pause("X")).await;
    assert_eq!(response.state, Some(AppState::Paused));
    assert!(ctx.backend.is_paused(&execution_id).await);

    let response = ctx.ok(Request::resume("X")).await;
    assert_eq!(response.state, Some(AppState::Running));
    assert!(!ctx.backend.is_paused(&execution_id).await);

    let response = ctx.ok(Request::stop("X")).await;
    assert_eq!(response.state, Some(AppState::Stopped));
    assert!(ctx.backend.live_executions().await.is_empty());

    let response = ctx.ok(Request::remove("X")).await;
    assert_eq!(response.state, Some(AppState::Removed));
    assert_eq!(ctx.backend.discarded().await, vec!["X".to_string()]);

    let err = ctx.err(Request::get_status("X")).await;
    assert_eq!(err.error_code, ErrorCode::NotFound);
    assert!(ctx.store.is_empty().await);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_pause_before_start_is_rejected() {
    let mut ctx = TestContext::new().await;
    ctx.install("X").await;

    let err = ctx.err(Request::pause("X")).await;
    assert_eq!(err.error_code, ErrorCode::InvalidTransition);

    let details = err.transition_details().unwrap();
    assert_eq!(details.current_state, AppState::Installed);
    assert_eq!(details.requested_action, LifecycleAction::Pause);
    assert_eq!(details.allowed_actions, vec![LifecycleAction::Start]);

    assert_eq!(ctx.status("X").await.state, AppState::Installed);
    assert_eq!(ctx.backend.launch_count(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_late_subscriber_gets_buffered_chunks_first() {
    let mut ctx = TestContext::new().await;
    let (_, execution_id) = ctx.install_running("X").await;

    for line in ["one\n", "two\n", "three\n"] {
        assert!(
            ctx.backend
                .emit_output(&execution_id, StreamTag::Stdout, line.as_bytes())
                .await
        );
    }
    // "one\ntwo\nthree\n"
    for _ in 0..100 {
        if ctx.engine().output().buffered_bytes() == 14 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = ctx
        .ok(Request::SubscribeOutput(OutputTarget::execution(&execution_id)))
        .await;
    let info: SubscriptionInfo = response.data_as().unwrap();
    assert_eq!(info.replayed, 3);

    ctx.backend
        .emit_output(&execution_id, StreamTag::Stderr, b"four\n")
        .await;

    let mut received = Vec::new();
    while received.len() < 4 {
        if let ServerMessage::Output(output) = ctx.client.next_unsolicited().await.unwrap() {
            assert_eq!(output.execution_id, execution_id);
            received.push((output.seq, output.stream_tag, output.decode_bytes().unwrap()));
        }
    }

    let texts: Vec<&[u8]> = received.iter().map(|(_, _, b)| b.as_slice()).collect();
    assert_eq!(
        texts,
        vec![&b"one\n"[..], &b"two\n"[..], &b"three\n"[..], &b"four\n"[..]]
    );
    assert!(received.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(received[3].1, StreamTag::Stderr);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_install_gets_suffixed_id() {
    let mut ctx = TestContext::new().await;

    let first = ctx.install("app-1").await;
    let second = ctx.install("app-1").await;
    assert_eq!(first, "app-1");
    assert_eq!(second, "app-1_2");

    // Distinct records: starting one leaves the other alone
    ctx.ok(Request::start("app-1_2")).await;
    assert_eq!(ctx.status("app-1").await.state, AppState::Installed);
    assert_eq!(ctx.status("app-1_2").await.state, AppState::Running);

    let list = ctx.ok(Request::List(Default::default())).await;
    assert_eq!(list.data.unwrap().as_array().unwrap().len(), 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_start_then_immediate_stop_ends_stopped() {
    let mut ctx = TestContext::new().await;
    ctx.install("X").await;

    let start = ctx.client.send(Request::start("X")).await.unwrap();
    let stop = ctx.client.send(Request::stop("X")).await.unwrap();

    let start_reply = ctx.client.wait_reply(&start).await.unwrap().unwrap();
    let stop_reply = ctx.client.wait_reply(&stop).await.unwrap().unwrap();
    assert_eq!(start_reply.state, Some(AppState::Running));
    assert_eq!(stop_reply.state, Some(AppState::Stopped));

    assert_eq!(ctx.status("X").await.state, AppState::Stopped);
    assert!(ctx.backend.live_executions().await.is_empty());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_restart_never_publishes_stopped() {
    let mut ctx = TestContext::new().await;
    let (_, old_execution) = ctx.install_running("X").await;

    let mut observer = ctx.connect().await;
    let reply = observer
        .request(Request::SubscribeOutput(OutputTarget::app("X")))
        .await
        .unwrap()
        .unwrap();
    let info: SubscriptionInfo = reply.data_as().unwrap();
    assert_eq!(info.execution_id, old_execution);

    let response = ctx.ok(Request::restart("X")).await;
    assert_eq!(response.state, Some(AppState::Running));

    let starting = next_state_change(&mut observer).await;
    assert_eq!(starting.state, AppState::Starting);
    let running = next_state_change(&mut observer).await;
    assert_eq!(running.state, AppState::Running);
    let new_execution = running.execution_id.unwrap();
    assert_ne!(new_execution, old_execution);

    // The old execution's termination is stale and changes nothing
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = ctx.status("X").await;
    assert_eq!(status.state, AppState::Running);
    assert_eq!(status.execution_id.as_deref(), Some(new_execution.as_str()));
    assert_eq!(ctx.backend.live_executions().await, vec![new_execution]);

    let mut observer = observer.with_read_timeout(Duration::from_millis(100));
    assert!(observer.next_unsolicited().await.is_err());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_state_changes_are_pushed_to_subscribers() {
    let mut ctx = TestContext::new().await;
    let (_, execution_id) = ctx.install_running("X").await;
    ctx.ok(Request::SubscribeOutput(OutputTarget::app("X"))).await;

    ctx.ok(Request::stop("X")).await;

    let stopping = next_state_change(&mut ctx.client).await;
    assert_eq!(stopping.state, AppState::Stopping);
    assert_eq!(stopping.execution_id.as_deref(), Some(execution_id.as_str()));
    let stopped = next_state_change(&mut ctx.client).await;
    assert_eq!(stopped.state, AppState::Stopped);
    assert_eq!(stopped.app_id, "X");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_crash_moves_to_error_and_allows_restart() {
    let mut ctx = TestContext::new().await;
    let (_, execution_id) = ctx.install_running("X").await;
    ctx.ok(Request::SubscribeOutput(OutputTarget::app("X"))).await;

    ctx.backend.exit(&execution_id, 1).await;

    let change = next_state_change(&mut ctx.client).await;
    assert_eq!(change.state, AppState::Error);
    assert_eq!(change.exit_code, Some(1));

    let status = ctx.status("X").await;
    assert_eq!(status.state, AppState::Error);
    assert_eq!(status.execution_id, None);
    assert_eq!(status.last_exit_code, Some(1));

    let response = ctx.ok(Request::restart("X")).await;
    assert_eq!(response.state, Some(AppState::Running));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_clean_exit_moves_to_stopped() {
    let mut ctx = TestContext::new().await;
    let (_, execution_id) = ctx.install_running("X").await;

    ctx.backend.exit(&execution_id, 0).await;
    ctx.wait_for_state("X", AppState::Stopped).await;

    let status = ctx.status("X").await;
    assert_eq!(status.last_exit_code, Some(0));
    assert_eq!(status.last_execution_id.as_deref(), Some(execution_id.as_str()));

    ctx.shutdown().await;
}
