use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection status as seen by callers of the lifecycle manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    ConnectedReadOnly,
    Expired,
    /// Terminal. Only reachable through an explicit shutdown.
    Died,
}

impl ConnectionStatus {
    /// Whether a handle in this status can serve operations.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::ConnectedReadOnly)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Died
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::ConnectedReadOnly => "connected_read_only",
            Self::Expired => "expired",
            Self::Died => "died",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw state reported by a session handle through its event sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    SyncConnected,
    ConnectedReadOnly,
    Expired,
    AuthFailed,
}

impl From<SessionState> for ConnectionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Disconnected => Self::Disconnected,
            SessionState::SyncConnected => Self::Connected,
            SessionState::ConnectedReadOnly => Self::ConnectedReadOnly,
            // A rejected handshake leaves the session unusable; a fresh one is needed.
            SessionState::Expired | SessionState::AuthFailed => Self::Expired,
        }
    }
}
