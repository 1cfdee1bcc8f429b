//! Error types for the relay and the client session.
//!
//! Relay errors never leave the server: an unknown join code becomes a
//! `not_found` frame for the joiner, an unknown forward target is only logged.
//! Session errors go back to whoever invoked the failing operation.

use crate::protocol::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no live connection owns call code '{0}'")]
    UnknownCode(String),

    #[error("target {0} is not connected")]
    UnknownTarget(ConnectionId),
}

#[derive(Debug, Error, Clone)]
pub enum SignalingError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("signaling connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a call attempt is already active on this session")]
    AlreadyActive,

    #[error("session has ended; start a new session for another call")]
    SessionFinished,

    #[error("call code must not be empty")]
    InvalidCode,

    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),

    #[error("local media must be acquired before answering an offer")]
    MissingLocalMedia,

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] TransportError),

    #[error("call code '{0}' not found")]
    CallNotFound(String),

    #[error("message from {0}, which is not the counterpart of this call")]
    UnknownPeer(ConnectionId),

    #[error("unexpected '{message}' while {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Failure to capture local media.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission to use the microphone was denied")]
    PermissionDenied,

    #[error("no audio input device available")]
    NoDevice,

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the peer transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}
