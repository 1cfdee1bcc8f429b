//! Shared harness: a relay bound to an ephemeral port, raw protocol clients,
//! and in-memory media/transport stand-ins for driving real sessions.

#![allow(dead_code)]

use async_trait::async_trait;
use callcode_signal::config::{ClientConfig, Config};
use callcode_signal::error::{MediaError, TransportError};
use callcode_signal::protocol::{ClientMessage, IceCandidate, ServerMessage, SessionDescription};
use callcode_signal::server::{AppState, build_router};
use callcode_signal::session::{
    LocalMedia, MediaConstraints, MediaDevices, PeerTransport, TransportEvent, TransportFactory,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub const OPUS_SDP: &str =
    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=fmtp:111 minptime=10;useinbandfec=1\r\n";

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: AppState,
    handle: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    pub async fn spawn() -> Self {
        let config = Config::from_vars(&HashMap::new()).expect("default config");
        let state = AppState::new(&config);
        let app = build_router(state.clone(), &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.ws_url(),
            ..ClientConfig::default()
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A protocol-level client that speaks raw frames.
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    pub async fn connect(relay: &TestRelay) -> Self {
        let (ws, _) = connect_async(relay.ws_url()).await.expect("connect");
        Self { ws }
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        let text = serde_json::to_string(msg).expect("encode");
        self.ws.send(Message::Text(text)).await.expect("send");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send");
    }

    /// Next protocol frame, skipping pings; `None` if nothing arrives in time.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame.expect("frame") {
                Message::Text(text) => return Some(serde_json::from_str(&text).expect("decode")),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("expected a frame from the relay")
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[derive(Default)]
pub struct MediaGate {
    disabled: AtomicBool,
    stopped: AtomicBool,
}

#[derive(Clone, Default)]
pub struct TestMedia(pub Arc<MediaGate>);

impl LocalMedia for TestMedia {
    fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.0.disabled.store(!enabled, Ordering::SeqCst);
        true
    }

    fn audio_enabled(&self) -> Option<bool> {
        Some(!self.0.disabled.load(Ordering::SeqCst))
    }

    fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
    }

    fn active_tracks(&self) -> usize {
        if self.0.stopped.load(Ordering::SeqCst) { 0 } else { 1 }
    }
}

#[derive(Default)]
pub struct TestDevices {
    pub handed_out: Arc<Mutex<Vec<TestMedia>>>,
}

#[async_trait]
impl MediaDevices for TestDevices {
    type Media = TestMedia;

    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<TestMedia, MediaError> {
        let media = TestMedia::default();
        self.handed_out.lock().push(media.clone());
        Ok(media)
    }
}

/// Transport stand-in: once the remote description is applied it "gathers"
/// one host candidate named after `label` and reports a remote track.
pub struct LoopbackTransport {
    label: &'static str,
    applied: Arc<Mutex<Vec<String>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    type Media = TestMedia;

    async fn add_local_media(&self, _media: &TestMedia) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(OPUS_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer(OPUS_SDP))
    }

    async fn set_local_description(&self, _: SessionDescription) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.applied
            .lock()
            .push(format!("remote {:?}", description.kind));
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(Some(IceCandidate {
                candidate: format!("candidate:{}", self.label),
                mid: Some("0".into()),
                m_line_index: Some(0),
            })));
        let _ = self.events.send(TransportEvent::LocalCandidate(None));
        let _ = self.events.send(TransportEvent::RemoteTrack {
            track_id: format!("{}-remote-audio", self.label),
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct LoopbackFactory {
    pub label: &'static str,
    pub applied: Arc<Mutex<Vec<String>>>,
}

impl LoopbackFactory {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    type Transport = LoopbackTransport;

    async fn create(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<LoopbackTransport, TransportError> {
        Ok(LoopbackTransport {
            label: self.label,
            applied: Arc::clone(&self.applied),
            events,
        })
    }
}
