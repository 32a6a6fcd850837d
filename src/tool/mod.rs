pub(crate) mod adapter;
pub(crate) mod schema;
pub(crate) mod types;

pub use adapter::ToolAdapter;
pub use types::{
    FailureKind, ToolContent, ToolDescriptor, ToolFailure, ToolInvocation, ToolOutput, ToolResult,
};
