//! WebSocket client side of the relay protocol.
//!
//! The client keeps one connection to the relay:
//! - a writer task serializes outbound frames in send order
//! - a reader task answers pending `create` requests and hands every other
//!   frame to the owner of the returned receiver
//!
//! Both the connect (including the relay's `welcome`) and the `create`
//! round-trip are bounded; hitting a bound yields `SignalingError::Timeout`
//! and nothing is retried.

use crate::config::ClientConfig;
use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// What the session needs from the signaling connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Identity the relay assigned to this connection.
    fn local_id(&self) -> ConnectionId;

    /// Asks the relay for a call code (our own identity).
    async fn create(&self) -> Result<ConnectionId, SignalingError>;

    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;
}

type PendingCreates = Arc<Mutex<HashMap<u64, oneshot::Sender<ConnectionId>>>>;

pub struct SignalingClient {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingCreates,
    next_request: AtomicU64,
    create_timeout: Duration,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to the relay and waits for it to assign an identity.
    ///
    /// Returns the client and the stream of frames that are not answers to
    /// our own `create` requests. The stream ends when the connection drops.
    pub async fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        tracing::info!("Connecting to signaling server: {}", config.server_url);

        match tokio::time::timeout(config.connect_timeout, Self::establish(config)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(url = %config.server_url, "signaling connect timed out");
                Err(SignalingError::Timeout("connection to the signaling server"))
            }
        }
    }

    async fn establish(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        let (ws_stream, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (welcome_tx, welcome_rx) = oneshot::channel();
        let pending: PendingCreates = Arc::new(Mutex::new(HashMap::new()));

        let pending_clone = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut welcome_tx = Some(welcome_tx);
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Welcome { id }) => {
                            if let Some(tx) = welcome_tx.take() {
                                let _ = tx.send(id);
                            }
                        }
                        Ok(ServerMessage::Created { request_id, code }) => {
                            if let Some(tx) = pending_clone.lock().remove(&request_id) {
                                let _ = tx.send(code);
                            }
                        }
                        Ok(msg) => {
                            let _ = events_tx.send(msg);
                        }
                        Err(e) => tracing::warn!("Ignoring unparsable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Fail outstanding creates instead of leaving them to time out
            pending_clone.lock().clear();
        });

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let id = match welcome_rx.await {
            Ok(id) => id,
            Err(_) => {
                reader.abort();
                return Err(SignalingError::Closed);
            }
        };
        tracing::info!(%id, "connected to relay");

        let client = Self {
            id,
            outbound,
            pending,
            next_request: AtomicU64::new(1),
            create_timeout: config.create_timeout,
            reader,
        };
        Ok((client, events_rx))
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    fn local_id(&self) -> ConnectionId {
        self.id
    }

    async fn create(&self) -> Result<ConnectionId, SignalingError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(ClientMessage::Create { request_id }) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.create_timeout, rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(SignalingError::Timeout("create call response"))
            }
        }
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.outbound.send(msg).map_err(|_| SignalingError::Closed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        // Dropping `outbound` lets the writer close the socket
        self.reader.abort();
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("id", &self.id)
            .field("pending_creates", &self.pending.lock().len())
            .finish()
    }
}
