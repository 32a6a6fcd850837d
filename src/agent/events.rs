use crate::tool::{FailureKind, ToolInvocation, ToolResult};
use serde::Serialize;

/// Observable progress of one run, in the order it happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PartialOutput {
        text: String,
    },
    ToolCallRequested {
        call_id: String,
        invocation: ToolInvocation,
    },
    ToolCallCompleted {
        call_id: String,
        tool_name: String,
        result: ToolResult,
    },
    FinalAnswer {
        text: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl RunEvent {
    pub(crate) fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        RunEvent::Failure {
            kind,
            message: message.into(),
        }
    }

    /// `FinalAnswer` and `Failure` end a run; nothing follows them
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::FinalAnswer { .. } | RunEvent::Failure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_events() {
        assert!(RunEvent::FinalAnswer { text: "done".to_string() }.is_terminal());
        assert!(RunEvent::failure(FailureKind::StreamClosed, "gone").is_terminal());
        assert!(!RunEvent::PartialOutput { text: "..".to_string() }.is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = RunEvent::ToolCallRequested {
            call_id: "call-1".to_string(),
            invocation: ToolInvocation::from_value(
                "search",
                json!({"origin": "Atlanta", "destination": "Las Vegas"}),
            ),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_call_requested");
        assert_eq!(value["invocation"]["name"], "search");
        assert_eq!(value["invocation"]["arguments"]["origin"], "Atlanta");
        assert!(value["invocation"].get("timeout").is_none());
    }
}
