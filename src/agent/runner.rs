use super::events::RunEvent;
use super::model::{ModelChunk, ReasoningModel, StepRequest, Turn};
use crate::bridge::Bridge;
use crate::tool::{FailureKind, ToolAdapter, ToolDescriptor, ToolInvocation, ToolResult};
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lazy, finite sequence of events for one request
pub type RunStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

pub const DEFAULT_INSTRUCTION: &str = "Help user to search for flights using available tools based on prompt. If return date not specified, use an empty string for one-way trips.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub instruction: String,
    /// Reasoning steps allowed before the run fails with `StepLimit`
    pub max_steps: usize,
    /// Tool calls from one step that may run at the same time
    pub max_concurrent_calls: usize,
    /// Per-call timeout; `None` uses the bridge's default
    pub call_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "flight_search_assistant".to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            max_steps: 8,
            max_concurrent_calls: 4,
            call_timeout: None,
        }
    }
}

/// Drives a reasoning model over a set of tool adapters
#[derive(Clone)]
pub struct Agent {
    model: Arc<dyn ReasoningModel>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(model: Arc<dyn ReasoningModel>, config: AgentConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start a run. Nothing happens until the returned stream is polled, and
    /// dropping it abandons any in-flight tool calls.
    pub fn run(&self, request: impl Into<String>, tools: &[ToolAdapter]) -> RunStream {
        Box::pin(run_loop(
            Arc::clone(&self.model),
            self.config.clone(),
            request.into(),
            tools.to_vec(),
        ))
    }

    /// Like `run`, but owns the bridge and closes it before the terminal
    /// event is handed out. Dropping the stream early drops the bridge too.
    pub fn run_and_close(
        &self,
        bridge: Bridge,
        tools: Vec<ToolAdapter>,
        request: impl Into<String>,
    ) -> RunStream {
        let mut events = self.run(request, &tools);
        Box::pin(stream! {
            while let Some(event) = events.next().await {
                if event.is_terminal() {
                    bridge.close().await;
                }
                yield event;
            }
        })
    }
}

fn run_loop(
    model: Arc<dyn ReasoningModel>,
    config: AgentConfig,
    request: String,
    tools: Vec<ToolAdapter>,
) -> impl Stream<Item = RunEvent> + Send {
    stream! {
        let descriptors: Vec<ToolDescriptor> =
            tools.iter().map(|t| t.descriptor().clone()).collect();
        let by_name: HashMap<String, ToolAdapter> = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();

        info!(
            "Agent '{}' running on {} with {} tools",
            config.name,
            model.name(),
            descriptors.len()
        );
        let mut turns = vec![Turn::User { text: request }];

        for step in 1..=config.max_steps {
            debug!("Reasoning step {}/{}", step, config.max_steps);
            let step_request = StepRequest {
                instruction: config.instruction.clone(),
                turns: turns.clone(),
                tools: descriptors.clone(),
            };

            let mut chunks = match model.step(&step_request).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    error!("Model step {} failed: {}", step, e);
                    yield RunEvent::failure(FailureKind::Model, e.to_string());
                    return;
                }
            };

            let mut text = String::new();
            let mut calls = Vec::new();
            let mut broken = None;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(ModelChunk::Text(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        yield RunEvent::PartialOutput { text: delta };
                    }
                    Ok(ModelChunk::ToolCall(call)) => calls.push(call),
                    Err(e) => {
                        broken = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = broken {
                error!("Model stream failed during step {}: {}", step, e);
                yield RunEvent::failure(FailureKind::Model, e.to_string());
                return;
            }

            if calls.is_empty() {
                info!("Agent '{}' finished after {} steps", config.name, step);
                yield RunEvent::FinalAnswer { text };
                return;
            }

            // Resolve every name before anything is dispatched
            let mut dispatch = Vec::with_capacity(calls.len());
            let mut unknown = None;
            for call in &calls {
                match by_name.get(&call.name) {
                    Some(adapter) => dispatch.push((call.clone(), adapter.clone())),
                    None => {
                        unknown = Some(call.name.clone());
                        break;
                    }
                }
            }
            if let Some(name) = unknown {
                warn!("Model requested undeclared tool '{}'", name);
                yield RunEvent::failure(
                    FailureKind::UnknownTool,
                    format!("model requested undeclared tool '{}'", name),
                );
                return;
            }

            turns.push(Turn::Model {
                text,
                tool_calls: calls,
            });

            for (call, _) in &dispatch {
                yield RunEvent::ToolCallRequested {
                    call_id: call.id.clone(),
                    invocation: ToolInvocation {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        timeout: config.call_timeout,
                    },
                };
            }

            let timeout = config.call_timeout;
            let mut completions = futures::stream::iter(dispatch.into_iter().map(
                move |(call, adapter)| async move {
                    let outcome = adapter.call(call.arguments.clone(), timeout).await;
                    (call, outcome)
                },
            ))
            .buffer_unordered(config.max_concurrent_calls.max(1));

            let mut fatal = None;
            while let Some((call, outcome)) = completions.next().await {
                let result = match outcome {
                    Ok(result) => result,
                    Err(e) if e.is_recoverable() => ToolResult::Failure(e.into()),
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                };

                turns.push(Turn::ToolResponse {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: result.clone(),
                });
                yield RunEvent::ToolCallCompleted {
                    call_id: call.id,
                    tool_name: call.name,
                    result,
                };
            }
            if let Some(e) = fatal {
                error!("Run aborted: {}", e);
                yield RunEvent::failure(e.failure_kind(), e.to_string());
                return;
            }
        }

        warn!(
            "Agent '{}' hit the step limit of {}",
            config.name, config.max_steps
        );
        yield RunEvent::failure(
            FailureKind::StepLimit,
            format!("no final answer after {} reasoning steps", config.max_steps),
        );
    }
}
