//! Agent run loop: a reasoning model driving discovered tools.

pub mod events;
pub mod gemini;
pub mod model;
pub mod runner;

pub use events::RunEvent;
pub use gemini::{DEFAULT_GEMINI_MODEL, GOOGLE_API_KEY_ENV, GeminiConfig, GeminiModel};
pub use model::{ModelChunk, ModelError, ModelStream, ReasoningModel, StepRequest, ToolCall, Turn};
pub use runner::{Agent, AgentConfig, DEFAULT_INSTRUCTION, RunStream};
