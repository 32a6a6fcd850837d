//! Launch stdio tool servers, discover their tools and drive them from an
//! agent run loop.

pub mod agent;
pub mod bridge;
pub mod config;
pub(crate) mod error;
pub mod protocol;
pub mod tool;
pub mod transport;

pub use agent::{Agent, AgentConfig, ReasoningModel, RunEvent, RunStream};
pub use bridge::{Bridge, BridgeOptions, BridgeState};
pub use error::{BridgeError, Result};
pub use tool::{ToolAdapter, ToolDescriptor, ToolInvocation, ToolResult};
pub use transport::ServerParams;
