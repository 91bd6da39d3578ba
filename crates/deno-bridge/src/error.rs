//! Error types for deno-bridge.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while driving the VM server bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The configured executable could not be found on spawn.
    #[error("Failed starting VM server. '{command}' is unavailable.")]
    ExecutableUnavailable {
        /// The command that could not be resolved.
        command: String,
    },

    /// The server process failed to spawn for a reason other than a
    /// missing executable.
    #[error("Failed starting VM server: {0}")]
    Spawn(#[source] std::io::Error),

    /// A permission configuration value had the wrong shape.
    #[error("{0}")]
    InvalidPermissions(String),

    /// An action was attempted on a VM before `create` succeeded or
    /// after `destroy`.
    #[error("VM is not created yet.")]
    NotCreated,

    /// The server answered with `status: "error"`. Carries the remote
    /// error text verbatim.
    #[error("{0}")]
    Protocol(String),

    /// The call was pending when the bridge closed, or was issued
    /// against a bridge that is not running.
    #[error("the VM server is closed")]
    ServerClosed,

    /// A line from the server could not be parsed. Never handed to a
    /// single caller directly; it forces the bridge closed, after which
    /// callers observe [`BridgeError::ServerClosed`].
    #[error("malformed line from VM server: {0}")]
    MalformedStream(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the server's stdio transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
