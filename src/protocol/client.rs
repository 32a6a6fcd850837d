use super::messages::{
    CallToolResult, Incoming, InitializeResult, JsonRpcNotification, JsonRpcReply, JsonRpcRequest,
    ListToolsResult, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_LIST_TOOLS,
    METHOD_NOT_FOUND, METHOD_PING, RpcError, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::error::{BridgeError, Result};
use crate::tool::{ToolDescriptor, ToolInvocation, ToolOutput, ToolResult};
use crate::transport::StdioTransport;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for the reader task to observe EOF before aborting it
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Protocol version agreed during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersion(pub String);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client identity sent in the `initialize` request
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What the reader task hands to a waiting request
enum Reply {
    Result(Value),
    Error(RpcError),
    Closed(String),
}

type PendingMap = DashMap<u64, oneshot::Sender<Reply>>;

/// Removes a pending slot when the waiting request goes away for any reason
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Typed request/response layer over a `StdioTransport`.
///
/// A background reader task owns the receive side and routes each response
/// to the pending slot registered under its correlation id, so any number of
/// requests can be in flight and answered in any order.
pub(crate) struct ProtocolClient {
    transport: Arc<StdioTransport>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    disconnected: Arc<AtomicBool>,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolClient {
    /// Take over the transport and start the reader task
    pub(crate) fn start(transport: Arc<StdioTransport>) -> Self {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let disconnected = Arc::new(AtomicBool::new(false));
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&disconnected),
            closed.clone(),
        ));

        Self {
            transport,
            next_id: AtomicU64::new(1),
            pending,
            disconnected,
            closed,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// True once the server's output stream has ended and pending slots were failed
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub(crate) async fn handshake(
        &self,
        client: &ClientInfo,
        timeout: Duration,
    ) -> Result<ProtocolVersion> {
        let params = json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[0],
            "capabilities": {},
            "clientInfo": {"name": client.name, "version": client.version},
        });

        let value = match self.request(METHOD_INITIALIZE, Some(params), timeout).await {
            Ok(Ok(value)) => value,
            Ok(Err(rpc)) => {
                return Err(BridgeError::handshake(format!(
                    "server rejected initialize: {}",
                    rpc.message
                )));
            }
            Err(BridgeError::Timeout { timeout, .. }) => {
                return Err(BridgeError::handshake(format!(
                    "no initialize response within {:?}",
                    timeout
                )));
            }
            Err(e) => return Err(e),
        };

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| BridgeError::handshake(format!("malformed initialize response: {}", e)))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(BridgeError::handshake(format!(
                "incompatible protocol version '{}' (supported: {})",
                result.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            )));
        }

        self.notify(METHOD_INITIALIZED).await?;

        match result.server_info {
            Some(info) => info!(
                "Handshake complete with {} {} (protocol {})",
                info.name,
                info.version.unwrap_or_default(),
                result.protocol_version
            ),
            None => info!(
                "Handshake complete (protocol {})",
                result.protocol_version
            ),
        }

        Ok(ProtocolVersion(result.protocol_version))
    }

    /// Fetch every page of the tool list and reject duplicate names
    pub(crate) async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = match self.request(METHOD_LIST_TOOLS, params, timeout).await? {
                Ok(value) => value,
                Err(rpc) => {
                    return Err(BridgeError::protocol(format!(
                        "tools/list failed: {}",
                        rpc.message
                    )));
                }
            };

            let page: ListToolsResult = serde_json::from_value(value)
                .map_err(|e| BridgeError::protocol(format!("malformed tools/list response: {}", e)))?;

            for tool in page.tools {
                if tool.name.is_empty() {
                    return Err(BridgeError::protocol("tool advertised with an empty name"));
                }
                if !seen.insert(tool.name.clone()) {
                    return Err(BridgeError::protocol(format!(
                        "duplicate tool name '{}'",
                        tool.name
                    )));
                }
                tools.push(ToolDescriptor::from(tool));
            }

            match page.next_cursor {
                Some(next) => {
                    if !cursors.insert(next.clone()) {
                        return Err(BridgeError::protocol(format!(
                            "tools/list cursor '{}' repeated",
                            next
                        )));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        debug!("Discovered {} tools", tools.len());
        Ok(tools)
    }

    /// Run one tool call; timeouts and tool-reported failures become a failed `ToolResult`
    pub(crate) async fn invoke(
        &self,
        invocation: &ToolInvocation,
        default_timeout: Duration,
    ) -> Result<ToolResult> {
        let timeout = invocation.timeout.unwrap_or(default_timeout);
        match self.call_tool(invocation, timeout).await {
            Ok(output) => Ok(ToolResult::Success(output)),
            Err(e) if e.is_recoverable() => {
                warn!("Tool '{}' failed: {}", invocation.name, e);
                Ok(ToolResult::Failure(e.into()))
            }
            Err(e) => {
                error!("Tool '{}' could not be called: {}", invocation.name, e);
                Err(e)
            }
        }
    }

    async fn call_tool(&self, invocation: &ToolInvocation, timeout: Duration) -> Result<ToolOutput> {
        let params = json!({
            "name": invocation.name,
            "arguments": invocation.arguments,
        });

        match self.request(METHOD_CALL_TOOL, Some(params), timeout).await? {
            Ok(value) => {
                let result: CallToolResult = match serde_json::from_value(value) {
                    Ok(result) => result,
                    Err(e) => {
                        let reason = format!("malformed tools/call response: {}", e);
                        self.poison(&reason);
                        return Err(BridgeError::protocol(reason));
                    }
                };
                if result.is_error {
                    let output = ToolOutput::from(result);
                    return Err(BridgeError::Tool {
                        kind: "tool_error".to_string(),
                        message: output.text(),
                    });
                }
                Ok(ToolOutput::from(result))
            }
            Err(rpc) => Err(BridgeError::Tool {
                kind: rpc.kind(),
                message: rpc.message,
            }),
        }
    }

    /// Send a request and wait for the response carrying the same id
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<std::result::Result<Value, RpcError>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        // Checked after registering so a concurrent disconnect either sees our
        // slot while draining or we see its flag here
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BridgeError::stream_closed(format!(
                "{} is no longer usable",
                self.transport.label()
            )));
        }

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        self.transport.send(&frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Result(value))) => Ok(Ok(value)),
            Ok(Ok(Reply::Error(error))) => Ok(Err(error)),
            Ok(Ok(Reply::Closed(reason))) => Err(BridgeError::StreamClosed(reason)),
            Ok(Err(_)) => Err(BridgeError::stream_closed("response slot dropped")),
            Err(_) => {
                warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.transport.send(&frame).await
    }

    /// Stop the server and fail whatever is still waiting. Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.transport.close().await;

        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(mut reader) = reader
            && tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
        {
            warn!("Reader task for {} did not stop, aborting", self.transport.label());
            reader.abort();
        }

        fail_pending(&self.pending, "bridge closed");
        self.closed.cancel();
    }

    /// Stop accepting requests after the server broke the protocol.
    ///
    /// The process keeps running until `shutdown` or `abort` reaps it.
    fn poison(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Tool server {} broke the protocol: {}", self.transport.label(), reason);
        fail_pending(&self.pending, reason);
        self.closed.cancel();
    }

    /// Synchronous teardown for `Drop` paths
    pub(crate) fn abort(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        self.transport.force_kill();
        fail_pending(&self.pending, "bridge dropped");
        self.closed.cancel();
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        // Covers an open() that was cancelled mid-handshake
        self.abort();
    }
}

async fn read_loop(
    transport: Arc<StdioTransport>,
    pending: Arc<PendingMap>,
    disconnected: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    let reason = loop {
        match transport.receive().await {
            Ok(line) => handle_line(&line, &pending, &transport).await,
            Err(e) => break e.to_string(),
        }
    };

    if transport.is_closed() {
        debug!("Reader for {} stopped: {}", transport.label(), reason);
    } else {
        warn!("Tool server {} went away: {}", transport.label(), reason);
    }

    disconnected.store(true, Ordering::SeqCst);
    fail_pending(&pending, &reason);
    closed.cancel();
}

async fn handle_line(line: &str, pending: &PendingMap, transport: &Arc<StdioTransport>) {
    match Incoming::parse(line) {
        Ok(Incoming::Response { id, outcome }) => match pending.remove(&id) {
            Some((_, slot)) => {
                let reply = match outcome {
                    Ok(value) => Reply::Result(value),
                    Err(error) => Reply::Error(error),
                };
                let _ = slot.send(reply);
            }
            None => warn!("Dropping response for unknown request id {}", id),
        },
        Ok(Incoming::Request { id, method }) => {
            let reply = if method == METHOD_PING {
                JsonRpcReply::result(id, json!({}))
            } else {
                debug!("Rejecting server request '{}'", method);
                JsonRpcReply::error(id, METHOD_NOT_FOUND, format!("method '{}' not supported", method))
            };
            // The reader must keep draining stdout while a caller holds the writer
            match serde_json::to_string(&reply) {
                Ok(frame) => {
                    let transport = Arc::clone(transport);
                    tokio::spawn(async move {
                        if let Err(e) = transport.send(&frame).await {
                            warn!("Failed to answer server request '{}': {}", method, e);
                        }
                    });
                }
                Err(e) => error!("Failed to encode reply: {}", e),
            }
        }
        Ok(Incoming::Notification { method, params }) => {
            debug!("Notification from {}: {} {:?}", transport.label(), method, params);
        }
        Err(reason) => warn!("Discarding frame from {}: {}", transport.label(), reason),
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, slot)) = pending.remove(&id) {
            let _ = slot.send(Reply::Closed(reason.to_string()));
        }
    }
}
