//! Core types for the SSE client.

use std::fmt;

/// Lifecycle of a [`StreamingClient`](crate::StreamingClient).
///
/// Transitions only move forward:
/// - `Idle -> Connected` via `connect()`
/// - `Idle | Connected -> Closed` via `close()` or a terminal failure
///
/// `Closed` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    Idle,
    /// `connect()` has been called and the client has not terminated.
    Connected,
    /// Closed by the caller or after a terminal failure.
    Closed,
}

impl ConnectionState {
    /// Check if this is the terminal state
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value sent in `Last-Event-ID` before the server has sent any id.
pub const INITIAL_RESUMPTION_TOKEN: &str = "0";
