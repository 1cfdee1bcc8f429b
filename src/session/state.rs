use super::media::ConnectivityStatus;
use crate::protocol::ConnectionId;

/// Which half of the handshake this session drives. Set once per call
/// attempt: the code holder that receives `ready` is the initiator, the party
/// that joined with a code is the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// `create` answered; acquiring local media.
    Initiating { code: ConnectionId },
    /// Holding a call code, waiting for someone to join with it.
    AwaitingPeer { code: ConnectionId },
    Negotiating { role: Role },
    Connected { role: Role },
    Ended,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initiating { .. } => "initiating",
            SessionState::AwaitingPeer { .. } => "awaiting peer",
            SessionState::Negotiating { .. } => "negotiating",
            SessionState::Connected { .. } => "connected",
            SessionState::Ended => "ended",
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            SessionState::Negotiating { role } | SessionState::Connected { role } => Some(*role),
            _ => None,
        }
    }

    /// True from the moment a call attempt starts until it ends.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Ended)
    }
}

/// Everything a UI needs to render a call, published on the session's
/// broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    LocalMedia { tracks: usize },
    RemoteTrack { track_id: String },
    Connectivity(ConnectivityStatus),
    /// Whole seconds since the call connected.
    Duration { seconds: u64 },
    MuteChanged { muted: bool },
    CallNotFound { code: String },
    Error(String),
}

/// Instructions a UI can send to a session that is being driven by
/// [`super::Session::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ToggleMute,
    EndCall,
}
