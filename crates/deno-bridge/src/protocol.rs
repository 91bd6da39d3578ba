//! Wire protocol types for the VM server.
//!
//! Messages are newline-delimited UTF-8 JSON over the server process's
//! stdin/stdout. Requests flow in, responses and console events flow out;
//! outbound frames carry a `type` field discriminating the two.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actions understood by the VM server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create a new VM session.
    Create,
    /// Evaluate code inside a session.
    Run,
    /// Call a (possibly dotted) function inside a session.
    Call,
    /// Destroy a session.
    Destroy,
    /// Shut the server down.
    Close,
    /// Liveness handshake.
    Ping,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Run => "run",
            Action::Call => "call",
            Action::Destroy => "destroy",
            Action::Close => "close",
            Action::Ping => "ping",
        };
        f.write_str(s)
    }
}

/// One request line sent to the server.
///
/// The `id` is stamped by the bridge, never by the caller. `vm_id` is
/// serialized even when absent (the server treats `null` as "no session
/// scope"); the remaining optional fields are omitted entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id, assigned by the bridge.
    pub id: u64,
    /// Action to perform.
    pub action: Action,
    /// Session scope, `null` for server-level actions and `create`.
    pub vm_id: Option<u64>,
    /// Session type for `create` (currently always `"VM"`).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<String>,
    /// Engine options for `create` (timeoutMs, worker permissions, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Code for `run`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Function name for `call`. May contain `.` to reach into objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Arguments for `call`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

impl Request {
    /// A bare request carrying only an action and an optional session id.
    /// The id is filled in by the bridge when the request is sent.
    pub fn new(action: Action, vm_id: Option<u64>) -> Self {
        Self {
            id: 0,
            action,
            vm_id,
            vm_type: None,
            options: None,
            code: None,
            function_name: None,
            args: None,
        }
    }

    /// A `run` request for the given session.
    pub fn run(vm_id: Option<u64>, code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(Action::Run, vm_id)
        }
    }

    /// A `call` request for the given session.
    pub fn call(vm_id: Option<u64>, function_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function_name: Some(function_name.into()),
            args: Some(args),
            ..Self::new(Action::Call, vm_id)
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// One response line from the server, correlated to a request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Correlation id matching the originating request.
    pub id: u64,
    /// Outcome of the request.
    pub status: Status,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Remote error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Console event kinds emitted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "console.log")]
    ConsoleLog,
    #[serde(rename = "console.error")]
    ConsoleError,
}

/// One out-of-band event line from the server. Not correlated to any
/// request; routed by `vm_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Session the event belongs to.
    pub vm_id: u64,
    /// Event kind.
    pub name: EventName,
    /// Event payload (the console line, without trailing newline).
    #[serde(default)]
    pub value: String,
}

/// One inbound frame, discriminated by the `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    Response(Response),
    Event(Event),
}
