// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Envelope decoding and response shape tests for edgekit-protocol.

use chrono::Utc;
use edgekit_protocol::message::{
    AppKind, AppState, Envelope, ErrorCode, ErrorResponse, InstallRequest, LifecycleAction,
    OutputMessage, OutputTarget, Request, RequestKind, ServerMessage, StateChangedMessage,
    StreamTag, SuccessResponse, TransitionDetails,
};
use serde_json::{Value, json};

#[test]
fn test_decode_lifecycle_request() {
    let envelope = Envelope::decode(r#"{"kind":"start","correlationId":"c-1","appId":"app-1"}"#)
        .expect("valid start request");

    assert_eq!(envelope.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(envelope.request, Request::start("app-1"));
    assert_eq!(
        envelope.request.lifecycle_action(),
        Some((LifecycleAction::Start, "app-1"))
    );
}

#[test]
fn test_decode_without_correlation_id() {
    let envelope = Envelope::decode(r#"{"kind":"list"}"#).expect("list without payload");
    assert_eq!(envelope.correlation_id, None);
    assert_eq!(envelope.request.kind(), RequestKind::List);
}

#[test]
fn test_decode_runtime_info() {
    let envelope = Envelope::decode(r#"{"kind":"runtime_info","correlationId":"r"}"#).unwrap();
    assert_eq!(envelope.request, Request::RuntimeInfo);
}

#[test]
fn test_decode_install_with_opaque_fields() {
    let text = json!({
        "kind": "install",
        "correlationId": "i-1",
        "appId": "fleet.app-1",
        "name": "Speed monitor",
        "appKind": "interpreted",
        "aliases": ["app-1"],
        "dependencies": [{"name": "numpy", "version": "1.26"}],
        "signals": ["Vehicle.Speed"],
        "payload": {"code": "print('hi')"}
    })
    .to_string();

    let envelope = Envelope::decode(&text).unwrap();
    let Request::Install(install) = envelope.request else {
        panic!("expected install");
    };
    assert_eq!(install.app_id, "fleet.app-1");
    assert_eq!(install.app_kind, AppKind::Interpreted);
    assert_eq!(install.aliases, vec!["app-1".to_string()]);
    assert_eq!(install.signals, vec![json!("Vehicle.Speed")]);
    assert_eq!(install.payload["code"], "print('hi')");
}

#[test]
fn test_decode_unknown_kind_keeps_correlation_id() {
    let err = Envelope::decode(r#"{"kind":"launch_rockets","correlationId":"x-9"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownMessageKind);
    assert_eq!(err.correlation_id.as_deref(), Some("x-9"));
}

#[test]
fn test_decode_kind_is_case_sensitive() {
    let err = Envelope::decode(r#"{"kind":"Start","appId":"a"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownMessageKind);
}

#[test]
fn test_decode_malformed_payload_is_validation_error() {
    let err = Envelope::decode(r#"{"kind":"start","correlationId":"c"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
    assert_eq!(err.correlation_id.as_deref(), Some("c"));

    let err = Envelope::decode(r#"{"kind":"install","appId":"a","appKind":"wasm"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[test]
fn test_decode_rejects_non_string_correlation_id() {
    for text in [
        r#"{"kind":"list","correlationId":42}"#,
        r#"{"kind":"list","correlationId":{"n":1}}"#,
        r#"{"kind":"list","correlationId":true}"#,
    ] {
        let err = Envelope::decode(text).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError, "{}", text);
        assert_eq!(err.correlation_id, None);
        assert!(err.message.contains("correlationId"));
    }

    // An explicit null is the same as no id
    let envelope = Envelope::decode(r#"{"kind":"list","correlationId":null}"#).unwrap();
    assert_eq!(envelope.correlation_id, None);
}

#[test]
fn test_decode_not_json_or_not_object() {
    let err = Envelope::decode("not json").unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
    assert_eq!(err.correlation_id, None);

    let err = Envelope::decode("[1,2,3]").unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);

    let err = Envelope::decode(r#"{"appId":"a"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[test]
fn test_encode_then_decode_preserves_correlation_id() {
    let envelope = Envelope::new(
        Some("abc".to_string()),
        Request::SubscribeOutput(OutputTarget::app("app-1")),
    );
    let text = envelope.encode().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["kind"], "subscribe_output");
    assert_eq!(value["correlationId"], "abc");
    assert_eq!(value["appId"], "app-1");

    assert_eq!(Envelope::decode(&text).unwrap(), envelope);
}

#[test]
fn test_success_response_shape() {
    let response = SuccessResponse::new(
        RequestKind::Start,
        Some("c-1".to_string()),
        Some(AppState::Running),
        "app-1 is running",
    );
    let text = ServerMessage::Success(response).encode().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();

    assert_eq!(value["kind"], "start");
    assert_eq!(value["correlationId"], "c-1");
    assert_eq!(value["status"], "success");
    assert_eq!(value["state"], "running");
    assert_eq!(value["result"], "app-1 is running");
    assert!(value.get("errorCode").is_none());
}

#[test]
fn test_success_response_without_state_has_null_state() {
    let response = SuccessResponse::new(RequestKind::List, None, None, "0 applications");
    let value = serde_json::to_value(&response).unwrap();
    assert!(value.get("state").is_some());
    assert_eq!(value["state"], Value::Null);
}

#[test]
fn test_error_response_shape() {
    let details = TransitionDetails {
        current_state: AppState::Installed,
        requested_action: LifecycleAction::Pause,
        allowed_actions: vec![LifecycleAction::Start],
    };
    let response = ErrorResponse::new(
        Some("c-2".to_string()),
        ErrorCode::InvalidTransition,
        "cannot pause from installed",
    )
    .with_details(serde_json::to_value(&details).unwrap());

    let text = ServerMessage::Error(response.clone()).encode().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();

    assert_eq!(value["kind"], "error");
    assert_eq!(value["correlationId"], "c-2");
    assert_eq!(value["errorCode"], "INVALID_TRANSITION");
    assert_eq!(value["details"]["currentState"], "installed");
    assert_eq!(value["details"]["requestedAction"], "pause");
    assert_eq!(value["details"]["allowedActions"], json!(["start"]));
    assert!(value.get("status").is_none());

    let decoded = ServerMessage::decode(&text).unwrap();
    assert_eq!(decoded, ServerMessage::Error(response.clone()));
    assert_eq!(response.transition_details(), Some(details));
}

#[test]
fn test_output_message_is_binary_safe() {
    let raw = [0u8, 159, 146, 150, b'\n'];
    let message = OutputMessage::new("exec-1", StreamTag::Stderr, 7, &raw, Utc::now());
    let text = ServerMessage::Output(message.clone()).encode().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();

    assert_eq!(value["kind"], "output");
    assert_eq!(value["executionId"], "exec-1");
    assert_eq!(value["streamTag"], "stderr");
    assert_eq!(value["seq"], 7);

    let ServerMessage::Output(decoded) = ServerMessage::decode(&text).unwrap() else {
        panic!("expected output message");
    };
    assert_eq!(decoded.decode_bytes().unwrap(), raw.to_vec());
    assert!(ServerMessage::Output(decoded).correlation_id().is_none());
}

#[test]
fn test_state_changed_message() {
    let message = StateChangedMessage {
        app_id: "app-1".to_string(),
        execution_id: Some("exec-1".to_string()),
        state: AppState::Error,
        exit_code: Some(137),
        timestamp: Utc::now(),
    };
    let text = ServerMessage::StateChanged(message.clone()).encode().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["kind"], "state_changed");
    assert_eq!(value["exitCode"], 137);

    let decoded = ServerMessage::decode(&text).unwrap();
    assert!(decoded.is_unsolicited());
    assert_eq!(decoded, ServerMessage::StateChanged(message));
}

#[test]
fn test_install_request_builder() {
    let request = InstallRequest::new("app-1", AppKind::ContainerImage, json!({"image": "alpine"}))
        .with_aliases(["fleet.app-1"]);
    let value = serde_json::to_value(Request::Install(request)).unwrap();
    assert_eq!(value["kind"], "install");
    assert_eq!(value["appKind"], "container_image");
    assert_eq!(value["aliases"], json!(["fleet.app-1"]));
}
