use std::fmt;

/// Per-connection lifecycle. A session only accepts `sync_request` and
/// `delta` frames while `Authenticated`; everything else about the
/// transition table lives in `ws.rs`, which drives this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, not yet upgraded into the message loop.
    Connecting,
    /// Waiting for a valid `auth` frame.
    Authenticating,
    /// Fully established; sync traffic flows.
    Authenticated,
    /// Close initiated (auth failure, heartbeat miss, shutdown).
    Disconnecting,
    /// Terminal.
    Disconnected,
}

impl SessionState {
    pub fn can_sync(&self) -> bool {
        matches!(self, SessionState::Authenticated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
