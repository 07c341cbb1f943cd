use serde::{Deserialize, Serialize};

/// The run-state of a session server, as understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionServerState {
    /// Child has been spawned and its RPC channel is open, but it has not
    /// yet been sent a configuration.
    Uninitialized,
    /// Configured, resources held, not rendering.
    Inactive,
    /// Rendering/serving its application session.
    Active,
    /// Child has exited, or never started.
    NotRunning,
    /// Child reported a fault, or the supervisor detected one.
    Error,
}

impl SessionServerState {
    /// Whether this state is one that a controller could legitimately ask
    /// `set_session_server_state` to restore after a crash.
    pub fn is_restartable(self) -> bool {
        matches!(self, SessionServerState::Inactive | SessionServerState::Active)
    }
}

impl std::fmt::Display for SessionServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionServerState::Uninitialized => "uninitialized",
            SessionServerState::Inactive => "inactive",
            SessionServerState::Active => "active",
            SessionServerState::NotRunning => "not_running",
            SessionServerState::Error => "error",
        };
        f.write_str(s)
    }
}
