use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity the relay assigns to a connection. Its string form is the
/// call code a caller shares out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the shape browsers produce: `{ "type", "sdp" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single connectivity candidate, forwarded as soon as it is discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m_line_index: Option<u16>,
}

/// Frames a client sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    // Answered with `Created` carrying the same request id
    Create { request_id: u64 },

    Join { code: String },

    Offer {
        description: SessionDescription,
        target: ConnectionId,
    },

    Answer {
        description: SessionDescription,
        target: ConnectionId,
    },

    Candidate {
        candidate: IceCandidate,
        target: ConnectionId,
    },
}

/// Frames the relay sends to a client. Forwarded variants carry the sender
/// identity, stamped by the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { id: ConnectionId },

    Created { request_id: u64, code: ConnectionId },

    Ready { peer: ConnectionId },

    NotFound { code: String },

    Offer {
        description: SessionDescription,
        caller: ConnectionId,
    },

    Answer {
        description: SessionDescription,
        from: ConnectionId,
    },

    Candidate {
        candidate: IceCandidate,
        from: ConnectionId,
    },

    Error { message: String },
}
