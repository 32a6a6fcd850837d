//! Scriptable stdio tool server used by the integration tests.
//!
//! Speaks the same newline-delimited JSON-RPC as a real tool server. `--mode`
//! selects a misbehaviour to exercise a specific failure path.

use clap::{Parser, ValueEnum};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use toolbridge::protocol::SUPPORTED_PROTOCOL_VERSIONS;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Well-behaved server
    Normal,
    /// Reads everything, answers nothing
    Silent,
    /// Answers initialize with a protocol version nobody supports
    BadVersion,
    /// Advertises the same tool twice
    Duplicate,
    /// Advertises no tools at all
    Empty,
    /// Exits as soon as a tool is called
    CrashAfterList,
    /// Splits the tool list over two pages
    Paginated,
    /// Writes garbage and stray responses around the handshake and answers
    /// every tool call with a result that is not a content list
    Malformed,
}

#[derive(Parser, Debug)]
#[command(name = "tool-stub")]
#[command(about = "Scriptable stdio tool server for tests", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    /// Keep running after stdin closes
    #[arg(long)]
    ignore_eof: bool,

    /// Free-form tag so tests can find this process by its command line
    #[arg(long)]
    marker: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    info!(
        "tool-stub {} starting in {:?} mode (marker {:?})",
        std::process::id(),
        args.mode,
        args.marker
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            let written = async {
                stdout.write_all(frame.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if written.await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if args.mode == Mode::Silent {
            debug!("Ignoring {}", line);
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable frame: {}", e);
                continue;
            }
        };

        // Replies to our own requests carry no method
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            debug!("Client replied: {}", line);
            continue;
        };
        let method = method.to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = message.get("id").cloned() else {
            on_notification(args.mode, &method, &tx);
            continue;
        };

        if method == "tools/call" && args.mode == Mode::CrashAfterList {
            warn!("Crashing on tools/call as instructed");
            std::process::exit(3);
        }

        if method == "initialize" && args.mode == Mode::Malformed {
            let _ = tx.send("this is not json".to_string());
            let _ = tx.send(json!({"jsonrpc": "2.0", "id": 9999, "result": {}}).to_string());
        }

        let tx = tx.clone();
        let mode = args.mode;
        tokio::spawn(async move {
            if let Some(frame) = respond(mode, id, &method, params).await {
                let _ = tx.send(frame);
            }
        });
    }

    info!("stdin closed");
    if args.ignore_eof {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

fn on_notification(mode: Mode, method: &str, tx: &mpsc::UnboundedSender<String>) {
    debug!("Notification {}", method);
    if method == "notifications/initialized" && mode == Mode::Normal {
        // Server-initiated traffic the client has to cope with
        let _ = tx.send(json!({"jsonrpc": "2.0", "id": "stub-ping", "method": "ping"}).to_string());
        let _ = tx.send(
            json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": "stub ready"}
            })
            .to_string(),
        );
    }
}

async fn respond(mode: Mode, id: Value, method: &str, params: Value) -> Option<String> {
    let outcome = match method {
        "initialize" => Ok(initialize_result(mode, &params)),
        "tools/list" => Ok(list_result(mode, &params)),
        "tools/call" if mode == Mode::Malformed => Ok(json!({"content": "not a content list"})),
        "tools/call" => call_tool(&params).await?,
        "ping" => Ok(json!({})),
        other => Err(json!({
            "code": -32601,
            "message": format!("method '{}' not found", other)
        })),
    };

    let frame = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
    };
    Some(frame.to_string())
}

fn initialize_result(mode: Mode, params: &Value) -> Value {
    let requested = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let version = if mode == Mode::BadVersion {
        "1999-01-01"
    } else if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
        requested
    } else {
        SUPPORTED_PROTOCOL_VERSIONS[0]
    };

    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "tool-stub", "version": env!("CARGO_PKG_VERSION")}
    })
}

fn list_result(mode: Mode, params: &Value) -> Value {
    let tools = all_tools();
    match mode {
        Mode::Empty => json!({"tools": []}),
        Mode::Duplicate => json!({"tools": [tools[0].clone(), tools[0].clone()]}),
        Mode::Paginated => match params.get("cursor").and_then(Value::as_str) {
            None => json!({"tools": tools[..2].to_vec(), "nextCursor": "page-2"}),
            Some(_) => json!({"tools": tools[2..].to_vec()}),
        },
        _ => json!({"tools": tools}),
    }
}

fn all_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "search_flights",
            "description": "Search one-way or return flights between two cities",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "origin": {"type": "string"},
                    "destination": {"type": "string"},
                    "date": {"type": "string"},
                    "return_date": {"type": "string"}
                },
                "required": ["origin", "destination", "date"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "delay",
            "description": "Answer with the tag after sleeping",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "ms": {"type": "integer"},
                    "tag": {"type": "string"}
                },
                "required": ["ms", "tag"]
            }
        }),
        json!({
            "name": "hang",
            "description": "Never answers",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "fail",
            "description": "Always reports a tool failure",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "explode",
            "description": "Answers with a JSON-RPC error",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "env",
            "description": "Echo one of the server's environment variables",
            "inputSchema": {
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }
        }),
    ]
}

/// `None` means the call is never answered
async fn call_tool(params: &Value) -> Option<Result<Value, Value>> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let empty = Map::new();
    let args = params
        .get("arguments")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    info!("tools/call {}", name);
    let outcome = match name {
        "search_flights" => Ok(search_flights(&arg("origin"), &arg("destination"), &arg("date"), &arg("return_date"))),
        "delay" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(&arg("tag")))
        }
        "hang" => return std::future::pending().await,
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "flight search backend unavailable"}],
            "isError": true
        })),
        "explode" => Err(json!({
            "code": -32000,
            "message": "too many requests",
            "data": {"kind": "rate_limited"}
        })),
        "env" => Ok(text_result(&std::env::var(arg("name")).unwrap_or_default())),
        other => Err(json!({
            "code": -32602,
            "message": format!("unknown tool '{}'", other)
        })),
    };
    Some(outcome)
}

fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

fn search_flights(origin: &str, destination: &str, date: &str, return_date: &str) -> Value {
    let flights = json!([
        {"airline": "Delta", "flight": "DL 1187", "origin": origin, "destination": destination, "date": date, "price": 289},
        {"airline": "Southwest", "flight": "WN 2314", "origin": origin, "destination": destination, "date": date, "price": 214}
    ]);
    json!({
        "content": [{
            "type": "text",
            "text": format!("Found 2 flights from {} to {} on {}", origin, destination, date)
        }],
        "structuredContent": {
            "flights": flights,
            "return_date": return_date
        }
    })
}
