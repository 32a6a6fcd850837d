use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// A tool advertised by the tool server during discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One request to run a tool with concrete arguments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            timeout: None,
        }
    }

    /// Build an invocation from a JSON object literal; non-object values give no arguments
    pub fn from_value(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, arguments)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

/// Successful payload of a tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolOutput {
    /// Concatenate all text parts, one per line
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Resource { text, .. } => text.as_deref(),
                ToolContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Structured content if the server sent any, otherwise the text parts as a string
    pub fn to_value(&self) -> Value {
        match &self.structured_content {
            Some(value) => value.clone(),
            None => Value::String(self.text()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    /// The remote tool reported a failure; carries the server's own kind
    Tool(String),
    Schema,
    UnknownTool,
    InvalidState,
    StreamClosed,
    Protocol,
    Handshake,
    Spawn,
    Io,
    Model,
    StepLimit,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::Tool(kind) => write!(f, "tool:{}", kind),
            FailureKind::Schema => f.write_str("schema"),
            FailureKind::UnknownTool => f.write_str("unknown_tool"),
            FailureKind::InvalidState => f.write_str("invalid_state"),
            FailureKind::StreamClosed => f.write_str("stream_closed"),
            FailureKind::Protocol => f.write_str("protocol"),
            FailureKind::Handshake => f.write_str("handshake"),
            FailureKind::Spawn => f.write_str("spawn"),
            FailureKind::Io => f.write_str("io"),
            FailureKind::Model => f.write_str("model"),
            FailureKind::StepLimit => f.write_str("step_limit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one tool call: always exactly one of success or failure
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success(ToolOutput),
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn output(&self) -> Option<&ToolOutput> {
        match self {
            ToolResult::Success(output) => Some(output),
            ToolResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            ToolResult::Success(_) => None,
            ToolResult::Failure(failure) => Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_text_joins_text_parts() {
        let output = ToolOutput {
            content: vec![
                ToolContent::Text {
                    text: "first".to_string(),
                },
                ToolContent::Image {
                    data: "aGk=".to_string(),
                    mime_type: "image/png".to_string(),
                },
                ToolContent::Resource {
                    uri: "file:///tmp/a.txt".to_string(),
                    mime_type: None,
                    text: Some("second".to_string()),
                },
            ],
            structured_content: None,
        };

        assert_eq!(output.text(), "first\nsecond");
        assert_eq!(output.to_value(), json!("first\nsecond"));
    }

    #[test]
    fn test_output_prefers_structured_content() {
        let output = ToolOutput {
            content: vec![ToolContent::Text {
                text: "ignored".to_string(),
            }],
            structured_content: Some(json!({"flights": []})),
        };

        assert_eq!(output.to_value(), json!({"flights": []}));
    }

    #[test]
    fn test_invocation_from_non_object() {
        let invocation = ToolInvocation::from_value("search", json!("not an object"));
        assert!(invocation.arguments.is_empty());
        assert!(invocation.timeout.is_none());
    }

    #[test]
    fn test_result_serialization_is_tagged() {
        let result = ToolResult::Failure(ToolFailure::new(FailureKind::Timeout, "too slow"));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["message"], "too slow");

        let result = ToolResult::Failure(ToolFailure::new(
            FailureKind::Tool("rate_limited".to_string()),
            "slow down",
        ));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["kind"]["tool"], "rate_limited");
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::StreamClosed.to_string(), "stream_closed");
        assert_eq!(
            FailureKind::Tool("invalid_params".to_string()).to_string(),
            "tool:invalid_params"
        );
    }
}
