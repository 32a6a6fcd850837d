pub(crate) mod state;

pub use state::BridgeState;

use crate::error::{BridgeError, Result};
use crate::protocol::{ClientInfo, ProtocolClient, ProtocolVersion};
use crate::tool::{ToolAdapter, ToolDescriptor, ToolInvocation, ToolResult};
use crate::transport::{ServerParams, StdioTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timeouts and identity used while a bridge is open
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    pub client_info: ClientInfo,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
            client_info: ClientInfo::default(),
        }
    }
}

/// Everything acquired by a successful open
struct Session {
    client: Arc<ProtocolClient>,
    version: ProtocolVersion,
    adapters: Vec<ToolAdapter>,
}

/// Settles the state to `Closed` when an open or close future is dropped part-way
struct Settle<'a> {
    state: &'a watch::Sender<BridgeState>,
    client: Option<Arc<ProtocolClient>>,
    armed: bool,
}

impl<'a> Settle<'a> {
    fn new(state: &'a watch::Sender<BridgeState>) -> Self {
        Self {
            state,
            client: None,
            armed: true,
        }
    }

    fn killing(mut self, client: Arc<ProtocolClient>) -> Self {
        self.client = Some(client);
        self
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(client) = self.client.take() {
            client.abort();
        }
        let settled = self.state.send_if_modified(|state| {
            if matches!(*state, BridgeState::Opening | BridgeState::Closing) {
                *state = BridgeState::Closed;
                true
            } else {
                false
            }
        });
        if settled {
            warn!("Bridge transition cancelled, state forced to closed");
        }
    }
}

/// Owns one tool server process and the tools it advertised.
///
/// `close()` is the graceful path and may be called any number of times.
/// Dropping a bridge that was never closed kills the server outright.
pub struct Bridge {
    params: ServerParams,
    options: BridgeOptions,
    state: watch::Sender<BridgeState>,
    session: Mutex<Option<Session>>,
    cancel_open: CancellationToken,
}

impl Bridge {
    pub fn new(params: ServerParams, options: BridgeOptions) -> Self {
        let (state, _) = watch::channel(BridgeState::Unopened);
        Self {
            params,
            options,
            state,
            session: Mutex::new(None),
            cancel_open: CancellationToken::new(),
        }
    }

    /// Spawn, handshake and discover in one step
    pub async fn connect(
        params: ServerParams,
        options: BridgeOptions,
    ) -> Result<(Bridge, Vec<ToolAdapter>)> {
        let bridge = Bridge::new(params, options);
        let tools = bridge.open().await?;
        Ok((bridge, tools))
    }

    /// Current lifecycle state; a server that exited on its own reports `Closed`
    pub fn state(&self) -> BridgeState {
        let state = *self.state.borrow();
        if state == BridgeState::Ready && self.with_session(|s| s.client.is_closed()) == Some(true)
        {
            return BridgeState::Closed;
        }
        state
    }

    /// Spawn the server, perform the handshake and build one adapter per tool.
    ///
    /// Any failure tears down whatever was acquired before the error is returned.
    /// So does dropping the returned future before it completes.
    pub async fn open(&self) -> Result<Vec<ToolAdapter>> {
        let mut admitted = false;
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Unopened {
                *state = BridgeState::Opening;
                admitted = true;
                true
            } else {
                false
            }
        });
        if !admitted {
            return Err(BridgeError::invalid_state("open", self.state()));
        }

        let settle = Settle::new(&self.state);
        info!("Opening tool bridge: {}", self.params.display());

        // Dropping establish() drops its client, which kills the server
        let established = tokio::select! {
            result = self.establish() => Some(result),
            _ = self.cancel_open.cancelled() => None,
        };

        let session = match established {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                error!("Failed to open tool bridge {}: {}", self.params.command, e);
                self.state.send_replace(BridgeState::Closed);
                return Err(e);
            }
            None => {
                warn!("Bridge closed during open, server stopped");
                self.state.send_replace(BridgeState::Closed);
                return Err(BridgeError::invalid_state("open", BridgeState::Closed));
            }
        };

        let adapters = session.adapters.clone();
        let client = Arc::clone(&session.client);
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }

        let mut ready = false;
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Opening {
                *state = BridgeState::Ready;
                ready = true;
                true
            } else {
                false
            }
        });

        if !ready {
            // close() ran while we were opening
            warn!("Bridge closed during open, discarding session");
            self.take_session();
            client.shutdown().await;
            self.state.send_replace(BridgeState::Closed);
            return Err(BridgeError::invalid_state("open", BridgeState::Closed));
        }
        settle.disarm();

        info!(
            "Tool bridge ready with {} tools: [{}]",
            adapters.len(),
            adapters
                .iter()
                .map(ToolAdapter::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(adapters)
    }

    async fn establish(&self) -> Result<Session> {
        let transport = Arc::new(StdioTransport::open(&self.params, self.options.shutdown_grace)?);
        let client = Arc::new(ProtocolClient::start(transport));

        let discovery = async {
            let version = client
                .handshake(&self.options.client_info, self.options.handshake_timeout)
                .await?;
            let descriptors = client.list_tools(self.options.handshake_timeout).await?;
            Ok::<_, BridgeError>((version, descriptors))
        };

        let (version, descriptors) = match discovery.await {
            Ok(found) => found,
            Err(e) => {
                client.shutdown().await;
                return Err(e);
            }
        };

        let adapters = descriptors
            .into_iter()
            .map(|descriptor| {
                ToolAdapter::new(
                    descriptor,
                    Arc::clone(&client),
                    self.state.subscribe(),
                    self.options.call_timeout,
                )
            })
            .collect();

        Ok(Session {
            client,
            version,
            adapters,
        })
    }

    /// Dispatch by name through the discovered tool set.
    ///
    /// Fails with `InvalidState` unless `Ready` and with `UnknownTool` for
    /// names the server never advertised; neither touches the process.
    pub async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResult> {
        let state = self.state();
        if state != BridgeState::Ready {
            return Err(BridgeError::invalid_state("invoke", state));
        }

        let adapter = self
            .with_session(|s| {
                s.adapters
                    .iter()
                    .find(|a| a.name() == invocation.name)
                    .cloned()
            })
            .flatten()
            .ok_or_else(|| BridgeError::UnknownTool(invocation.name.clone()))?;

        adapter.call(invocation.arguments, invocation.timeout).await
    }

    /// Shut the server down and release its streams. Safe to call repeatedly.
    ///
    /// Returns once the bridge is `Closed`, including when another task is
    /// opening or closing it concurrently.
    pub async fn close(&self) {
        let mut previous = BridgeState::Closed;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                BridgeState::Unopened => {
                    *state = BridgeState::Closed;
                    true
                }
                BridgeState::Opening | BridgeState::Ready => {
                    *state = BridgeState::Closing;
                    true
                }
                BridgeState::Closing | BridgeState::Closed => false,
            }
        });

        match previous {
            BridgeState::Unopened | BridgeState::Closed => {
                debug!("Tool bridge already {}", self.state());
                return;
            }
            BridgeState::Opening => {
                // open() stops its handshake and settles the state
                self.cancel_open.cancel();
                self.wait_closed().await;
                return;
            }
            BridgeState::Closing => {
                self.wait_closed().await;
                return;
            }
            BridgeState::Ready => {}
        }

        info!("Closing tool bridge: {}", self.params.command);
        if let Some(session) = self.take_session() {
            let settle = Settle::new(&self.state).killing(Arc::clone(&session.client));
            session.client.shutdown().await;
            settle.disarm();
        }
        self.state.send_replace(BridgeState::Closed);
        info!("Tool bridge closed: {}", self.params.command);
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == BridgeState::Closed).await;
    }

    /// Adapters for every discovered tool; empty unless `Ready`
    pub fn tools(&self) -> Vec<ToolAdapter> {
        self.with_session(|s| s.adapters.clone()).unwrap_or_default()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.with_session(|s| s.adapters.iter().map(|a| a.descriptor().clone()).collect())
            .unwrap_or_default()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.with_session(|s| s.version.clone())
    }

    /// OS process id of the tool server while one is attached
    pub fn pid(&self) -> Option<u32> {
        self.with_session(|s| s.client.pid()).flatten()
    }

    /// Requests currently waiting for a response
    pub fn in_flight(&self) -> usize {
        self.with_session(|s| s.client.in_flight()).unwrap_or(0)
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Option<T> {
        self.session.lock().ok().and_then(|s| s.as_ref().map(f))
    }

    fn take_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            warn!(
                "Tool bridge {} dropped without close(), killing server",
                self.params.command
            );
            session.client.abort();
        }
        self.state.send_replace(BridgeState::Closed);
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("command", &self.params.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
