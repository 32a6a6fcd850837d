use crate::tool::{FailureKind, ToolFailure};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required environment variable not set: {0}")]
    MissingEnvironment(String),

    #[error("Failed to spawn tool server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Tool reported {kind}: {message}")]
    Tool { kind: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {message}")]
    Schema { tool: String, message: String },

    #[error("Operation '{operation}' not allowed while bridge is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Tool server stream closed: {0}")]
    StreamClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] crate::agent::ModelError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol(message.into())
    }

    pub(crate) fn handshake(message: impl Into<String>) -> Self {
        BridgeError::Handshake(message.into())
    }

    pub(crate) fn stream_closed(message: impl Into<String>) -> Self {
        BridgeError::StreamClosed(message.into())
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        BridgeError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    pub(crate) fn schema(tool: &str, message: impl Into<String>) -> Self {
        BridgeError::Schema {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Classify the error into the failure kind reported to run-loop observers
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BridgeError::Config(_) | BridgeError::MissingEnvironment(_) => FailureKind::Spawn,
            BridgeError::Spawn { .. } => FailureKind::Spawn,
            BridgeError::Handshake(_) => FailureKind::Handshake,
            BridgeError::Protocol(_) | BridgeError::Json(_) => FailureKind::Protocol,
            BridgeError::Timeout { .. } => FailureKind::Timeout,
            BridgeError::Tool { kind, .. } => FailureKind::Tool(kind.clone()),
            BridgeError::UnknownTool(_) => FailureKind::UnknownTool,
            BridgeError::Schema { .. } => FailureKind::Schema,
            BridgeError::InvalidState { .. } => FailureKind::InvalidState,
            BridgeError::StreamClosed(_) => FailureKind::StreamClosed,
            BridgeError::Io(_) => FailureKind::Io,
            BridgeError::Model(_) => FailureKind::Model,
        }
    }

    /// Whether the error only affects the call that produced it.
    ///
    /// Recoverable errors are reported back as a failed tool result; everything
    /// else means the bridge can no longer serve calls.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. } | BridgeError::Tool { .. } | BridgeError::Schema { .. }
        )
    }
}

impl From<&BridgeError> for ToolFailure {
    fn from(err: &BridgeError) -> Self {
        let message = match err {
            BridgeError::Tool { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ToolFailure::new(err.failure_kind(), message)
    }
}

impl From<BridgeError> for ToolFailure {
    fn from(err: BridgeError) -> Self {
        ToolFailure::from(&err)
    }
}
