//! Google Gemini `generateContent` backend with function calling.

use super::model::{ModelChunk, ModelError, ModelStream, ReasoningModel, StepRequest, ToolCall, Turn};
use crate::tool::{ToolDescriptor, ToolResult};
use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub const GOOGLE_API_KEY_ENV: &str = "GOOGLE_API_KEY";
pub const GEMINI_MODEL_ENV: &str = "GEMINI_MODEL";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro-exp-03-25";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";

/// Schema keywords the function declaration endpoint refuses
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "title", "default", "examples"];

#[derive(Clone)]
pub struct GeminiConfig {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Model from `GEMINI_MODEL` (or the default) and key from `GOOGLE_API_KEY`
    pub fn from_env() -> Self {
        let model = env::var(GEMINI_MODEL_ENV).unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        let mut config = Self::new(model);
        config.api_key = env::var(GOOGLE_API_KEY_ENV).ok().filter(|k| !k.is_empty());
        config
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Result<Self, ModelError> {
        self.base_url = sanitize_base_url(base_url.as_ref())?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

pub struct GeminiModel {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    next_call_id: AtomicU64,
}

impl GeminiModel {
    pub fn new(config: GeminiConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelError::configuration(format!("{} is not set", GOOGLE_API_KEY_ENV)))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}v1beta/models/{}:generateContent", config.base_url, config.model),
            api_key,
            model: config.model,
            next_call_id: AtomicU64::new(1),
        })
    }

    fn build_request(&self, request: &StepRequest) -> GenerateContentRequest {
        let system_instruction = (!request.instruction.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(&request.instruction)],
        });

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolGroup {
                function_declarations: request.tools.iter().map(declaration).collect(),
            }]
        };

        GenerateContentRequest {
            system_instruction,
            contents: map_turns(&request.turns),
            tools,
        }
    }

    fn chunks_from(&self, response: GenerateContentResponse) -> Result<Vec<ModelChunk>, ModelError> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::response("Gemini returned no candidates"))?;

        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        let mut chunks = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some(text) = part.text {
                chunks.push(ModelChunk::Text(text));
            }
            if let Some(call) = part.function_call {
                let arguments = match call.args {
                    Some(Value::Object(map)) => map,
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(ModelError::response(format!(
                            "arguments for '{}' are not an object: {}",
                            call.name, other
                        )));
                    }
                };
                let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
                chunks.push(ModelChunk::ToolCall(ToolCall {
                    id: format!("call-{}", id),
                    name: call.name,
                    arguments,
                }));
            }
        }
        Ok(chunks)
    }
}

impl fmt::Debug for GeminiModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiModel")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReasoningModel for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn step(&self, request: &StepRequest) -> Result<ModelStream, ModelError> {
        let payload = self.build_request(request);
        debug!(
            "Sending {} turns and {} tools to {}",
            payload.contents.len(),
            request.tools.len(),
            self.model
        );

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::transport(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelError::transport(format!("failed to read Gemini response: {}", e)))?;
        if !status.is_success() {
            return Err(ModelError::response(format!("Gemini returned {}: {}", status, body)));
        }

        let decoded: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|e| ModelError::response(format!("failed to decode Gemini response: {}", e)))?;
        let chunks = self.chunks_from(decoded)?;

        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

fn declaration(tool: &ToolDescriptor) -> FunctionDeclaration {
    let parameters = sanitize_schema(&tool.input_schema);
    let empty = parameters
        .get("properties")
        .and_then(Value::as_object)
        .is_none_or(Map::is_empty);

    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: (!empty).then_some(parameters),
    }
}

fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sanitize_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Consecutive tool responses share one `user` content
fn map_turns(turns: &[Turn]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::with_capacity(turns.len());
    let mut responses: Vec<Part> = Vec::new();

    let flush = |contents: &mut Vec<Content>, responses: &mut Vec<Part>| {
        if !responses.is_empty() {
            contents.push(Content {
                role: Some("user".to_string()),
                parts: std::mem::take(responses),
            });
        }
    };

    for turn in turns {
        match turn {
            Turn::User { text } => {
                flush(&mut contents, &mut responses);
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part::text(text)],
                });
            }
            Turn::Model { text, tool_calls } => {
                flush(&mut contents, &mut responses);
                let mut parts = Vec::with_capacity(tool_calls.len() + 1);
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
                parts.extend(tool_calls.iter().map(|call| Part {
                    function_call: Some(FunctionCall {
                        name: call.name.clone(),
                        args: Some(Value::Object(call.arguments.clone())),
                    }),
                    ..Default::default()
                }));
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            Turn::ToolResponse { name, result, .. } => responses.push(Part {
                function_response: Some(FunctionResponse {
                    name: name.clone(),
                    response: response_payload(result),
                }),
                ..Default::default()
            }),
        }
    }
    flush(&mut contents, &mut responses);
    contents
}

fn response_payload(result: &ToolResult) -> Value {
    match result {
        ToolResult::Success(output) => json!({ "result": output.to_value() }),
        ToolResult::Failure(failure) => json!({
            "error": { "kind": failure.kind.to_string(), "message": failure.message }
        }),
    }
}

fn sanitize_base_url(input: &str) -> Result<String, ModelError> {
    let mut base = input.trim().to_string();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ModelError::configuration(
            "Gemini base URL must start with http:// or https://",
        ));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    reqwest::Url::parse(&base)
        .map_err(|e| ModelError::configuration(format!("invalid Gemini base URL: {}", e)))?;
    Ok(base)
}
