#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use toolbridge::agent::{
    ModelChunk, ModelError, ModelStream, ReasoningModel, StepRequest, ToolCall, Turn,
};
use toolbridge::{BridgeOptions, ServerParams, ToolResult};

// ──────────────────────────────────────────────
// Tool server launch
// ──────────────────────────────────────────────

/// Launch parameters for the bundled stub server in the given mode
pub fn stub_params(mode: &str) -> ServerParams {
    ServerParams::new(env!("CARGO_BIN_EXE_tool-stub")).args(["--mode", mode])
}

/// Same as `stub_params`, tagged so the process can be found by command line
pub fn marked_stub_params(mode: &str, marker: &str) -> ServerParams {
    stub_params(mode).args(["--marker", marker])
}

/// Short timeouts so failure paths finish quickly
pub fn fast_options() -> BridgeOptions {
    BridgeOptions {
        handshake_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

// ──────────────────────────────────────────────
// Process inspection (Linux /proc)
// ──────────────────────────────────────────────

/// Running and not a zombie
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // State follows the parenthesised command name
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | Some("X"))
        }
        Err(_) => false,
    }
}

pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    !process_alive(pid)
}

/// Live processes whose command line contains `marker`
pub fn processes_with_marker(marker: &str) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            std::fs::read(format!("/proc/{}/cmdline", pid))
                .map(|cmdline| String::from_utf8_lossy(&cmdline).contains(marker))
                .unwrap_or(false)
        })
        .filter(|pid| process_alive(*pid))
        .collect()
}

/// Polls until no live process carries `marker`
pub async fn wait_for_marker_gone(marker: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if processes_with_marker(marker).is_empty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    processes_with_marker(marker).is_empty()
}

pub fn unique_marker(test: &str) -> String {
    format!("{}-{}-{}", test, std::process::id(), rand_suffix())
}

fn rand_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

// ──────────────────────────────────────────────
// Reasoning models
// ──────────────────────────────────────────────

/// Turns "Find flights from X to Y YYYY-MM-DD" into one `search_flights` call,
/// then answers from the tool output.
pub struct FlightModel {
    pub steps: AtomicUsize,
}

impl FlightModel {
    pub fn new() -> Self {
        Self {
            steps: AtomicUsize::new(0),
        }
    }
}

pub fn parse_flight_query(query: &str) -> Option<(String, String, String)> {
    let (_, rest) = query.split_once(" from ")?;
    let (origin, rest) = rest.split_once(" to ")?;
    let (destination, date) = rest.trim().rsplit_once(' ')?;
    Some((
        origin.trim().to_string(),
        destination.trim().to_string(),
        date.trim().to_string(),
    ))
}

#[async_trait]
impl ReasoningModel for FlightModel {
    fn name(&self) -> &str {
        "flight-rules"
    }

    async fn step(&self, request: &StepRequest) -> Result<ModelStream, ModelError> {
        let step = self.steps.fetch_add(1, Ordering::SeqCst);

        let answered = request.turns.iter().find_map(|turn| match turn {
            Turn::ToolResponse { result, .. } => Some(result.clone()),
            _ => None,
        });

        let chunks = match answered {
            Some(ToolResult::Success(output)) => vec![ModelChunk::Text(output.text())],
            Some(ToolResult::Failure(failure)) => {
                vec![ModelChunk::Text(format!("Search failed: {}", failure.message))]
            }
            None => {
                let query = request
                    .turns
                    .iter()
                    .find_map(|turn| match turn {
                        Turn::User { text } => Some(text.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                let (origin, destination, date) = parse_flight_query(&query)
                    .ok_or_else(|| ModelError::response("could not understand the query"))?;

                let mut arguments = Map::new();
                arguments.insert("origin".to_string(), json!(origin));
                arguments.insert("destination".to_string(), json!(destination));
                arguments.insert("date".to_string(), json!(date));
                vec![ModelChunk::ToolCall(ToolCall {
                    id: format!("call-{}", step + 1),
                    name: "search_flights".to_string(),
                    arguments,
                })]
            }
        };

        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

/// Replays fixed steps; once they run out it answers with the tool results seen so far
pub struct ScriptedModel {
    steps: Mutex<Vec<Vec<ModelChunk>>>,
}

impl ScriptedModel {
    pub fn new(mut steps: Vec<Vec<ModelChunk>>) -> Self {
        steps.reverse();
        Self {
            steps: Mutex::new(steps),
        }
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ModelChunk {
    let arguments = match arguments {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ModelChunk::ToolCall(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn step(&self, request: &StepRequest) -> Result<ModelStream, ModelError> {
        let next = self.steps.lock().unwrap().pop();
        let chunks = match next {
            Some(chunks) => chunks,
            None => {
                let seen = request
                    .turns
                    .iter()
                    .filter(|turn| matches!(turn, Turn::ToolResponse { .. }))
                    .count();
                vec![ModelChunk::Text(format!("saw {} tool results", seen))]
            }
        };
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}
