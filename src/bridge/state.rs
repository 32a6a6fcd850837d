use serde::Serialize;
use std::fmt;

/// Lifecycle of a bridge: `Unopened -> Opening -> Ready -> Closing -> Closed`.
///
/// A failed open goes straight from `Opening` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Unopened,
    Opening,
    Ready,
    Closing,
    Closed,
}

impl BridgeState {
    pub fn is_terminal(self) -> bool {
        self == BridgeState::Closed
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgeState::Unopened => "unopened",
            BridgeState::Opening => "opening",
            BridgeState::Ready => "ready",
            BridgeState::Closing => "closing",
            BridgeState::Closed => "closed",
        })
    }
}
