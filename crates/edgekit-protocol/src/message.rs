// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message types for the edgekit control channel.
//!
//! Every frame on the channel is a single JSON object carrying a `kind`
//! discriminator. Inbound requests are decoded in two stages: the `kind`
//! string is first matched against the closed [`RequestKind`] set, and only
//! then is the full payload parsed into [`Request`]. This keeps
//! "unknown kind" and "malformed payload" distinguishable on the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Lifecycle vocabulary
// ============================================================================

/// Lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// Installed and never started, or reset after install.
    Installed,
    /// Launch in progress.
    Starting,
    /// Execution is live.
    Running,
    /// Pause in progress.
    Pausing,
    /// Execution is suspended.
    Paused,
    /// Resume in progress.
    Resuming,
    /// Termination in progress.
    Stopping,
    /// Last execution ended cleanly or was stopped.
    Stopped,
    /// Removal in progress.
    Uninstalling,
    /// Backend failure or abnormal exit.
    Error,
    /// Record deleted. Only ever reported in the response to `remove`.
    Removed,
}

impl AppState {
    /// All states, in declaration order.
    pub const ALL: [AppState; 11] = [
        AppState::Installed,
        AppState::Starting,
        AppState::Running,
        AppState::Pausing,
        AppState::Paused,
        AppState::Resuming,
        AppState::Stopping,
        AppState::Stopped,
        AppState::Uninstalling,
        AppState::Error,
        AppState::Removed,
    ];

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Installed => "installed",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Pausing => "pausing",
            AppState::Paused => "paused",
            AppState::Resuming => "resuming",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
            AppState::Uninstalling => "uninstalling",
            AppState::Error => "error",
            AppState::Removed => "removed",
        }
    }

    /// True for the in-flight states that exist only while an operation
    /// holds the application's lock.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            AppState::Starting
                | AppState::Pausing
                | AppState::Resuming
                | AppState::Stopping
                | AppState::Uninstalling
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-requested lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    Remove,
}

impl LifecycleAction {
    /// All actions, in the column order of the transition table.
    pub const ALL: [LifecycleAction; 6] = [
        LifecycleAction::Start,
        LifecycleAction::Stop,
        LifecycleAction::Pause,
        LifecycleAction::Resume,
        LifecycleAction::Restart,
        LifecycleAction::Remove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Pause => "pause",
            LifecycleAction::Resume => "resume",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Remove => "remove",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an application payload is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// Source code run by an interpreter.
    Interpreted,
    /// Native executable.
    CompiledBinary,
    /// Pre-built container image.
    ContainerImage,
}

/// Output stream of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

// ============================================================================
// Requests
// ============================================================================

/// The closed set of request kinds the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Install,
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    Remove,
    GetStatus,
    List,
    SubscribeOutput,
    UnsubscribeOutput,
    WriteInput,
    RuntimeInfo,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Install => "install",
            RequestKind::Start => "start",
            RequestKind::Stop => "stop",
            RequestKind::Pause => "pause",
            RequestKind::Resume => "resume",
            RequestKind::Restart => "restart",
            RequestKind::Remove => "remove",
            RequestKind::GetStatus => "get_status",
            RequestKind::List => "list",
            RequestKind::SubscribeOutput => "subscribe_output",
            RequestKind::UnsubscribeOutput => "unsubscribe_output",
            RequestKind::WriteInput => "write_input",
            RequestKind::RuntimeInfo => "runtime_info",
        }
    }

    /// Kinds that never produce a response.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, RequestKind::WriteInput)
    }
}

impl FromStr for RequestKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string())).map_err(|_| ())
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded request. The `kind` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Install(InstallRequest),
    Start(AppTarget),
    Stop(AppTarget),
    Pause(AppTarget),
    Resume(AppTarget),
    Restart(AppTarget),
    Remove(AppTarget),
    GetStatus(AppTarget),
    List(ListRequest),
    SubscribeOutput(OutputTarget),
    UnsubscribeOutput(OutputTarget),
    WriteInput(WriteInputRequest),
    RuntimeInfo,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Install(_) => RequestKind::Install,
            Request::Start(_) => RequestKind::Start,
            Request::Stop(_) => RequestKind::Stop,
            Request::Pause(_) => RequestKind::Pause,
            Request::Resume(_) => RequestKind::Resume,
            Request::Restart(_) => RequestKind::Restart,
            Request::Remove(_) => RequestKind::Remove,
            Request::GetStatus(_) => RequestKind::GetStatus,
            Request::List(_) => RequestKind::List,
            Request::SubscribeOutput(_) => RequestKind::SubscribeOutput,
            Request::UnsubscribeOutput(_) => RequestKind::UnsubscribeOutput,
            Request::WriteInput(_) => RequestKind::WriteInput,
            Request::RuntimeInfo => RequestKind::RuntimeInfo,
        }
    }

    /// The lifecycle action this request asks for, if it is one.
    pub fn lifecycle_action(&self) -> Option<(LifecycleAction, &str)> {
        match self {
            Request::Start(t) => Some((LifecycleAction::Start, &t.app_id)),
            Request::Stop(t) => Some((LifecycleAction::Stop, &t.app_id)),
            Request::Pause(t) => Some((LifecycleAction::Pause, &t.app_id)),
            Request::Resume(t) => Some((LifecycleAction::Resume, &t.app_id)),
            Request::Restart(t) => Some((LifecycleAction::Restart, &t.app_id)),
            Request::Remove(t) => Some((LifecycleAction::Remove, &t.app_id)),
            _ => None,
        }
    }

    pub fn start(app_id: impl Into<String>) -> Self {
        Request::Start(AppTarget::new(app_id))
    }

    pub fn stop(app_id: impl Into<String>) -> Self {
        Request::Stop(AppTarget::new(app_id))
    }

    pub fn pause(app_id: impl Into<String>) -> Self {
        Request::Pause(AppTarget::new(app_id))
    }

    pub fn resume(app_id: impl Into<String>) -> Self {
        Request::Resume(AppTarget::new(app_id))
    }

    pub fn restart(app_id: impl Into<String>) -> Self {
        Request::Restart(AppTarget::new(app_id))
    }

    pub fn remove(app_id: impl Into<String>) -> Self {
        Request::Remove(AppTarget::new(app_id))
    }

    pub fn get_status(app_id: impl Into<String>) -> Self {
        Request::GetStatus(AppTarget::new(app_id))
    }

    /// Build a lifecycle request for `action`.
    pub fn for_action(action: LifecycleAction, app_id: impl Into<String>) -> Self {
        let target = AppTarget::new(app_id);
        match action {
            LifecycleAction::Start => Request::Start(target),
            LifecycleAction::Stop => Request::Stop(target),
            LifecycleAction::Pause => Request::Pause(target),
            LifecycleAction::Resume => Request::Resume(target),
            LifecycleAction::Restart => Request::Restart(target),
            LifecycleAction::Remove => Request::Remove(target),
        }
    }
}

/// Identifies one application by any of its accepted identifier forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTarget {
    pub app_id: String,
}

impl AppTarget {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }
}

/// Install a new application.
///
/// `dependencies`, `signals` and `payload` are owned by collaborators
/// outside the engine core and are carried through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Desired identifier. The engine may suffix it to keep it unique.
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub app_kind: AppKind,
    /// Alternate identifier forms that should resolve to this application.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<Value>,
    #[serde(default)]
    pub payload: Value,
}

impl InstallRequest {
    pub fn new(app_id: impl Into<String>, app_kind: AppKind, payload: Value) -> Self {
        Self {
            app_id: app_id.into(),
            name: None,
            app_kind,
            aliases: Vec::new(),
            dependencies: Vec::new(),
            signals: Vec::new(),
            payload,
        }
    }

    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }
}

/// List applications, optionally filtered by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AppState>,
}

/// Selects an execution either directly or through its application.
///
/// When only `appId` is given the application's current (or most recent)
/// execution is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl OutputTarget {
    pub fn execution(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            app_id: None,
        }
    }

    pub fn app(app_id: impl Into<String>) -> Self {
        Self {
            execution_id: None,
            app_id: Some(app_id.into()),
        }
    }
}

/// Forward bytes to an execution's standard input. Never answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteInputRequest {
    #[serde(flatten)]
    pub target: OutputTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
}

impl WriteInputRequest {
    /// Bytes to write, from `data` or the base64 `dataBase64` field.
    pub fn bytes(&self) -> Result<Vec<u8>, String> {
        match (&self.data, &self.data_base64) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(encoded)) => BASE64
                .decode(encoded)
                .map_err(|e| format!("dataBase64 is not valid base64: {}", e)),
            (Some(_), Some(_)) => Err("only one of data or dataBase64 may be set".to_string()),
            (None, None) => Err("one of data or dataBase64 is required".to_string()),
        }
    }
}

// ============================================================================
// Inbound envelope decoding
// ============================================================================

/// A request together with the caller's correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: Option<String>,
    pub request: Request,
}

impl Envelope {
    pub fn new(correlation_id: Option<String>, request: Request) -> Self {
        Self {
            correlation_id,
            request,
        }
    }

    /// Decode one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| DecodeError {
            correlation_id: None,
            code: ErrorCode::ValidationError,
            message: format!("message is not valid JSON: {}", e),
        })?;

        let Value::Object(ref map) = value else {
            return Err(DecodeError {
                correlation_id: None,
                code: ErrorCode::ValidationError,
                message: "message must be a JSON object".to_string(),
            });
        };

        let correlation_id = match map.get("correlationId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            // Anything else could not be echoed back unchanged.
            Some(_) => {
                return Err(DecodeError {
                    correlation_id: None,
                    code: ErrorCode::ValidationError,
                    message: "field `correlationId` must be a string".to_string(),
                });
            }
        };

        let kind = match map.get("kind") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(_) => {
                return Err(DecodeError {
                    correlation_id,
                    code: ErrorCode::ValidationError,
                    message: "field `kind` must be a string".to_string(),
                });
            }
            None => {
                return Err(DecodeError {
                    correlation_id,
                    code: ErrorCode::ValidationError,
                    message: "missing field `kind`".to_string(),
                });
            }
        };

        if kind.parse::<RequestKind>().is_err() {
            return Err(DecodeError {
                correlation_id,
                code: ErrorCode::UnknownMessageKind,
                message: format!("unknown message kind: {}", kind),
            });
        }

        let request: Request = serde_json::from_value(value).map_err(|e| DecodeError {
            correlation_id: correlation_id.clone(),
            code: ErrorCode::ValidationError,
            message: format!("invalid payload: {}", e),
        })?;

        Ok(Self {
            correlation_id,
            request,
        })
    }

    /// Encode as a single text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.request)?;
        if let (Value::Object(map), Some(id)) = (&mut value, &self.correlation_id) {
            map.insert("correlationId".to_string(), Value::String(id.clone()));
        }
        serde_json::to_string(&value)
    }
}

/// An inbound frame that could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DecodeError {
    /// Echoed back when it could be read from the frame.
    pub correlation_id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

impl DecodeError {
    pub fn into_response(self) -> ErrorResponse {
        ErrorResponse::new(self.correlation_id, self.code, self.message)
    }
}

// ============================================================================
// Outbound messages
// ============================================================================

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidTransition,
    OperationInProgress,
    DuplicateIdentifier,
    BackendError,
    CapacityExceeded,
    UnknownMessageKind,
    ValidationError,
    RequestTimeout,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::OperationInProgress => "OPERATION_IN_PROGRESS",
            ErrorCode::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::UnknownMessageKind => "UNKNOWN_MESSAGE_KIND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker serialized as `"status": "success"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    #[default]
    Success,
}

/// Successful answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub kind: RequestKind,
    pub correlation_id: Option<String>,
    pub status: ResponseStatus,
    /// Lifecycle state after the request, `null` when the request does not
    /// concern a single application.
    pub state: Option<AppState>,
    /// Human-readable summary.
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SuccessResponse {
    pub fn new(
        kind: RequestKind,
        correlation_id: Option<String>,
        state: Option<AppState>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            correlation_id,
            status: ResponseStatus::Success,
            state,
            result: result.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Deserialize `data` into a typed value.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

/// Failed answer to a request. Serialized with `"kind": "error"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub correlation_id: Option<String>,
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(correlation_id: Option<String>, error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Typed view of `details` for `INVALID_TRANSITION` errors.
    pub fn transition_details(&self) -> Option<TransitionDetails> {
        if self.error_code != ErrorCode::InvalidTransition {
            return None;
        }
        self.details
            .clone()
            .and_then(|d| serde_json::from_value(d).ok())
    }
}

/// Details attached to an `INVALID_TRANSITION` error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDetails {
    pub current_state: AppState,
    pub requested_action: LifecycleAction,
    /// Actions that would have been accepted from `current_state`.
    pub allowed_actions: Vec<LifecycleAction>,
}

/// A chunk of execution output pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMessage {
    pub execution_id: String,
    pub stream_tag: StreamTag,
    /// Monotonic per-execution sequence number.
    pub seq: u64,
    /// Base64 encoded bytes.
    pub bytes: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputMessage {
    pub fn new(
        execution_id: impl Into<String>,
        stream_tag: StreamTag,
        seq: u64,
        bytes: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            stream_tag,
            seq,
            bytes: BASE64.encode(bytes),
            timestamp,
        }
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.bytes)
    }
}

/// Unsolicited notification of a committed lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedMessage {
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub state: AppState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// Any frame the engine sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Success(SuccessResponse),
    Error(ErrorResponse),
    Output(OutputMessage),
    StateChanged(StateChangedMessage),
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Tagged<'a> {
    Error(&'a ErrorResponse),
    Output(&'a OutputMessage),
    StateChanged(&'a StateChangedMessage),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedOwned {
    Error(ErrorResponse),
    Output(OutputMessage),
    StateChanged(StateChangedMessage),
}

impl ServerMessage {
    /// Correlation id, for responses.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Success(r) => r.correlation_id.as_deref(),
            ServerMessage::Error(r) => r.correlation_id.as_deref(),
            ServerMessage::Output(_) | ServerMessage::StateChanged(_) => None,
        }
    }

    /// True for output and state notifications.
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self,
            ServerMessage::Output(_) | ServerMessage::StateChanged(_)
        )
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            ServerMessage::Success(r) => serde_json::to_string(r),
            ServerMessage::Error(r) => serde_json::to_string(&Tagged::Error(r)),
            ServerMessage::Output(m) => serde_json::to_string(&Tagged::Output(m)),
            ServerMessage::StateChanged(m) => serde_json::to_string(&Tagged::StateChanged(m)),
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "error" | "output" | "state_changed" => {
                Ok(match serde_json::from_value::<TaggedOwned>(value)? {
                    TaggedOwned::Error(r) => ServerMessage::Error(r),
                    TaggedOwned::Output(m) => ServerMessage::Output(m),
                    TaggedOwned::StateChanged(m) => ServerMessage::StateChanged(m),
                })
            }
            _ => Ok(ServerMessage::Success(serde_json::from_value(value)?)),
        }
    }
}

impl From<SuccessResponse> for ServerMessage {
    fn from(r: SuccessResponse) -> Self {
        ServerMessage::Success(r)
    }
}

impl From<ErrorResponse> for ServerMessage {
    fn from(r: ErrorResponse) -> Self {
        ServerMessage::Error(r)
    }
}

// ============================================================================
// Response payloads
// ============================================================================

/// Wire view of an application record, carried in `data` by `get_status`,
/// `list` and `install`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub app_id: String,
    pub display_name: String,
    pub app_kind: AppKind,
    pub state: AppState,
    /// Execution currently attached to the application.
    pub execution_id: Option<String>,
    /// Most recent execution, kept after it ends.
    pub last_execution_id: Option<String>,
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Value>,
    #[serde(default)]
    pub signals: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

/// `data` of a successful `subscribe_output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub execution_id: String,
    /// Sequence number of the first chunk that will be delivered.
    pub cursor: u64,
    /// Number of buffered chunks replayed ahead of live output.
    pub replayed: usize,
}

/// `data` of a successful `runtime_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub runtime_name: String,
    pub version: String,
    pub uptime_ms: u64,
    pub applications: usize,
    /// Application count per state.
    pub by_state: BTreeMap<AppState, usize>,
    pub active_executions: usize,
    pub connected_clients: usize,
    pub pending_requests: usize,
    pub buffered_bytes: usize,
}
