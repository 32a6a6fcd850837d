//! The seam between the run loop and whatever produces reasoning steps.

use crate::tool::{ToolDescriptor, ToolResult};
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use std::pin::Pin;
use thiserror::Error;

/// Streaming output of one reasoning step
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Model is misconfigured or missing credentials
    #[error("model not configured: {reason}")]
    Configuration { reason: String },

    #[error("model transport error: {reason}")]
    Transport { reason: String },

    /// The provider answered with something we could not use
    #[error("model response error: {reason}")]
    Response { reason: String },
}

impl ModelError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn response(reason: impl Into<String>) -> Self {
        Self::Response {
            reason: reason.into(),
        }
    }
}

/// A tool call the model asked for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    ToolCall(ToolCall),
}

/// One entry of the conversation handed to the model
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User {
        text: String,
    },
    Model {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResponse {
        call_id: String,
        name: String,
        result: ToolResult,
    },
}

/// Input for a single reasoning step
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub instruction: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDescriptor>,
}

/// Produces reasoning steps: text to show and tool calls to dispatch.
///
/// A step that yields no tool calls is the final answer.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    fn name(&self) -> &str;

    async fn step(&self, request: &StepRequest) -> Result<ModelStream, ModelError>;
}
