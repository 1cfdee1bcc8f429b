//! Identity registry and identity-addressed forwarding.
//!
//! The relay knows nothing about callers or receivers. It maps each live
//! connection to its outbound queue and delivers frames to whichever identity
//! the sender names. Every connection has exactly one FIFO queue, and a
//! connection's inbound frames are handled one at a time, so frames from one
//! sender to one target arrive in the order they were sent.

use crate::error::RelayError;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type PeerMap = Arc<DashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>;

#[derive(Clone, Default)]
pub struct Relay {
    peers: PeerMap,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and queues its `welcome` frame.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut id = ConnectionId::new();
        // Identities are unique among live connections
        while self.peers.contains_key(&id) {
            id = ConnectionId::new();
        }
        let _ = tx.send(ServerMessage::Welcome { id });
        self.peers.insert(id, tx);
        info!(%id, live = self.peers.len(), "connection registered");
        (id, rx)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.peers.remove(&id).is_some() {
            info!(%id, live = self.peers.len(), "connection removed");
        }
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Handles one inbound frame from `sender`. Nothing is reported back to
    /// the sender except `created` and `not_found`.
    pub fn handle(&self, sender: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Create { request_id } => {
                self.create(sender, request_id);
            }
            ClientMessage::Join { code } => {
                if let Err(err) = self.join(sender, &code) {
                    debug!(joiner = %sender, %err, "join failed");
                    let _ = self.deliver(sender, ServerMessage::NotFound { code });
                }
            }
            other => {
                if let Err(err) = self.forward(sender, other) {
                    debug!(from = %sender, %err, "forward dropped");
                }
            }
        }
    }

    /// Reports a problem with a frame back to the connection that sent it.
    pub fn reject(&self, id: ConnectionId, message: impl Into<String>) {
        let _ = self.deliver(
            id,
            ServerMessage::Error {
                message: message.into(),
            },
        );
    }

    /// Answers a `create` request with the requester's own identity.
    pub fn create(&self, requester: ConnectionId, request_id: u64) -> ConnectionId {
        info!(%requester, "create call request");
        let _ = self.deliver(
            requester,
            ServerMessage::Created {
                request_id,
                code: requester,
            },
        );
        requester
    }

    /// Notifies the owner of `code` that `joiner` wants to talk to it.
    pub fn join(&self, joiner: ConnectionId, code: &str) -> Result<ConnectionId, RelayError> {
        let owner: ConnectionId = code
            .parse()
            .map_err(|_| RelayError::UnknownCode(code.to_string()))?;
        if owner == joiner {
            return Err(RelayError::UnknownCode(code.to_string()));
        }
        info!(%joiner, %owner, "receiver joined, sending ready");
        self.deliver(owner, ServerMessage::Ready { peer: joiner })
            .map_err(|_| RelayError::UnknownCode(code.to_string()))?;
        Ok(owner)
    }

    /// Forwards an `offer`, `answer` or `candidate` to its target, stamping
    /// the sender identity. `create` and `join` are not forwardable.
    pub fn forward(&self, sender: ConnectionId, msg: ClientMessage) -> Result<(), RelayError> {
        let (target, routed) = match msg {
            ClientMessage::Offer {
                description,
                target,
            } => (
                target,
                ServerMessage::Offer {
                    description,
                    caller: sender,
                },
            ),
            ClientMessage::Answer {
                description,
                target,
            } => (
                target,
                ServerMessage::Answer {
                    description,
                    from: sender,
                },
            ),
            ClientMessage::Candidate { candidate, target } => (
                target,
                ServerMessage::Candidate {
                    candidate,
                    from: sender,
                },
            ),
            ClientMessage::Create { .. } | ClientMessage::Join { .. } => {
                warn!(from = %sender, "control frame passed to forward");
                return Ok(());
            }
        };
        debug!(from = %sender, %target, "forwarding");
        self.deliver(target, routed)
    }

    /// Looks up `target` and enqueues `msg` while holding the shard lock, so
    /// a concurrent disconnect either happens before (no delivery) or after
    /// (delivered) but never in between.
    fn deliver(&self, target: ConnectionId, msg: ServerMessage) -> Result<(), RelayError> {
        let peer = self
            .peers
            .get(&target)
            .ok_or(RelayError::UnknownTarget(target))?;
        peer.send(msg).map_err(|_| RelayError::UnknownTarget(target))
    }
}
