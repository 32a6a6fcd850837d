use super::params::ServerParams;
use crate::error::{BridgeError, Result};
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Child process speaking newline-delimited records over stdin/stdout.
///
/// Exactly one task may sit in `receive` at a time; `send` is serialised
/// through its own lock so writers never interleave frames.
pub(crate) struct StdioTransport {
    label: String,
    pid: Option<u32>,
    writer: tokio::sync::Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>,
    reader: tokio::sync::Mutex<FramedRead<ChildStdout, LinesCodec>>,
    child: Mutex<Option<Child>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the tool server; required environment is checked first
    pub(crate) fn open(params: &ServerParams, shutdown_grace: Duration) -> Result<Self> {
        params.check_required()?;

        info!("Spawning tool server: {}", params.display());

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn tool server '{}': {}", params.command, e);
            BridgeError::Spawn {
                command: params.command.clone(),
                source: e,
            }
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(BridgeError::Spawn {
                    command: params.command.clone(),
                    source: std::io::Error::other("child stdio was not captured"),
                });
            }
        };

        let label = params.command.clone();
        let stderr_task = child.stderr.take().map(|stderr| {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    debug!("[{} stderr] {}", label, line);
                }
            })
        });

        let pid = child.id();
        debug!("Tool server '{}' running with pid {:?}", label, pid);

        Ok(Self {
            label,
            pid,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(stdin, LinesCodec::new()))),
            reader: tokio::sync::Mutex::new(FramedRead::new(stdout, LinesCodec::new())),
            child: Mutex::new(Some(child)),
            stderr_task: Mutex::new(stderr_task),
            shutdown_grace,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one frame; the codec appends the newline delimiter
    pub(crate) async fn send(&self, frame: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| BridgeError::stream_closed("input stream already closed"))?;

        debug!("-> {}: {}", self.label, frame);
        sink.send(frame).await.map_err(|e| match e {
            LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
                BridgeError::stream_closed(format!("{} exited: {}", self.label, io))
            }
            LinesCodecError::Io(io) => BridgeError::Io(io),
            LinesCodecError::MaxLineLengthExceeded => {
                BridgeError::protocol("outgoing frame exceeds line limit")
            }
        })
    }

    /// Wait for the next complete frame, skipping blank lines
    pub(crate) async fn receive(&self) -> Result<String> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    debug!("<- {}: {}", self.label, line);
                    return Ok(line);
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(BridgeError::Io(e)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(BridgeError::protocol("incoming frame exceeds line limit"));
                }
                None => {
                    return Err(BridgeError::stream_closed(format!(
                        "{} closed its output stream",
                        self.label
                    )));
                }
            }
        }
    }

    /// Close stdin, give the child the grace period to exit, then kill it.
    ///
    /// Never fails and only acts on the first call.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing tool server: {}", self.label);

        // Dropping the sink closes the child's stdin
        self.writer.lock().await.take();

        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Tool server '{}' exited: {}", self.label, status);
                }
                Ok(Err(e)) => {
                    warn!("Failed waiting for tool server '{}': {}", self.label, e);
                    let _ = child.kill().await;
                }
                Err(_) => {
                    warn!(
                        "Tool server '{}' did not exit within {:?}, killing",
                        self.label, self.shutdown_grace
                    );
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill tool server '{}': {}", self.label, e);
                    }
                }
            }
        }

        self.abort_stderr();
    }

    /// Synchronous last resort used from `Drop` paths
    pub(crate) fn force_kill(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut child) = self.child.lock().ok().and_then(|mut c| c.take()) {
            warn!("Force-killing tool server: {}", self.label);
            let _ = child.start_kill();
        }
        self.abort_stderr();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn abort_stderr(&self) {
        if let Some(task) = self.stderr_task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.force_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Duration {
        Duration::from_millis(500)
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let params = ServerParams::new("definitely-not-a-real-tool-server-binary");
        let result = StdioTransport::open(&params, fast());
        assert!(matches!(result, Err(BridgeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_required_env_checked_before_spawn() {
        let params = ServerParams::new("cat").require_env("TOOLBRIDGE_NEVER_SET");
        let result = StdioTransport::open(&params, fast());
        assert!(matches!(result, Err(BridgeError::MissingEnvironment(_))));
    }

    #[tokio::test]
    async fn test_cat_echoes_frames() {
        let transport = StdioTransport::open(&ServerParams::new("cat"), fast()).unwrap();
        assert!(transport.pid().is_some());

        transport.send(r#"{"id":1}"#).await.unwrap();
        transport.send(r#"{"id":2}"#).await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), r#"{"id":1}"#);
        assert_eq!(transport.receive().await.unwrap(), r#"{"id":2}"#);

        transport.close().await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_large_frame_round_trip() {
        let transport = StdioTransport::open(&ServerParams::new("cat"), fast()).unwrap();
        let payload = format!(r#"{{"data":"{}"}}"#, "x".repeat(1 << 20));

        // cat stops reading once its stdout pipe fills, so drain while sending
        let (sent, received) = tokio::join!(transport.send(&payload), transport.receive());
        sent.unwrap();
        assert_eq!(received.unwrap().len(), payload.len());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = StdioTransport::open(&ServerParams::new("cat"), fast()).unwrap();
        transport.close().await;
        transport.close().await;

        let err = transport.send("{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::StreamClosed(_)));
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, BridgeError::StreamClosed(_)));
    }

    #[tokio::test]
    async fn test_receive_after_child_exit() {
        let transport = StdioTransport::open(&ServerParams::new("true"), fast()).unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, BridgeError::StreamClosed(_)));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_kills_child_ignoring_eof() {
        let params = ServerParams::new("sleep").arg("30");
        let transport = StdioTransport::open(&params, Duration::from_millis(100)).unwrap();

        let started = std::time::Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
