use super::schema::validate_arguments;
use super::types::{ToolDescriptor, ToolInvocation, ToolResult};
use crate::bridge::BridgeState;
use crate::error::{BridgeError, Result};
use crate::protocol::ProtocolClient;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// A discovered remote tool, callable by name without protocol knowledge.
///
/// Adapters are cheap to clone and stay tied to the bridge that created them:
/// once that bridge leaves the `Ready` state every call fails with
/// `InvalidState` before touching the tool server.
#[derive(Clone)]
pub struct ToolAdapter {
    descriptor: Arc<ToolDescriptor>,
    client: Arc<ProtocolClient>,
    state: watch::Receiver<BridgeState>,
    default_timeout: Duration,
}

impl ToolAdapter {
    pub(crate) fn new(
        descriptor: ToolDescriptor,
        client: Arc<ProtocolClient>,
        state: watch::Receiver<BridgeState>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            client,
            state,
            default_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.descriptor.input_schema
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    /// Check arguments against the input schema without any round-trip
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        validate_arguments(&self.descriptor.name, &self.descriptor.input_schema, arguments)
    }

    /// Validate, then run the tool on the server.
    ///
    /// Timeouts and failures reported by the tool come back as
    /// `ToolResult::Failure`; misuse (bad arguments, bridge not ready) and
    /// bridge-fatal conditions come back as `Err`.
    pub async fn call(
        &self,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<ToolResult> {
        self.ensure_ready()?;
        self.validate(&arguments)?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let invocation =
            ToolInvocation::new(self.descriptor.name.clone(), arguments).with_timeout(timeout);

        debug!("Calling tool '{}' with timeout {:?}", self.name(), timeout);
        self.client.invoke(&invocation, timeout).await
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = *self.state.borrow();
        if state != BridgeState::Ready {
            return Err(BridgeError::invalid_state("invoke", state));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAdapter")
            .field("name", &self.descriptor.name)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
