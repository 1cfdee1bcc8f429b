//! Client-side call session.
//!
//! A [`Session`] drives exactly one call attempt from `create`/`join` to a
//! connected transport and tears it down. It owns the local capture and the
//! transport; nothing else may hold them. A finished session cannot be reused,
//! build a new one for the next call.
//!
//! ```text
//! Idle ──create──> Initiating ──media──> AwaitingPeer ──ready──┐
//!  │                                                            v
//!  └──media + join───────────────────────────────────────> Negotiating
//!                                                               │ first remote track
//!                                                               v
//!                                              Ended <──── Connected
//! ```
//!
//! Candidates that arrive before the transport can take them (no transport
//! yet, or no remote description yet) are queued and applied in arrival order
//! once it can.

mod media;
#[cfg(feature = "webrtc")]
pub mod rtc;
mod sdp;
mod signaling;
mod state;

pub use media::{
    ConnectivityStatus, LocalMedia, MediaConstraints, MediaDevices, PeerTransport,
    TransportEvent, TransportFactory,
};
pub use sdp::{HIGH_QUALITY_AUDIO, INBAND_FEC, request_high_quality_audio};
pub use signaling::{SignalingChannel, SignalingClient};
pub use state::{Role, SessionCommand, SessionEvent, SessionState};

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::protocol::{ClientMessage, ConnectionId, IceCandidate, ServerMessage, SessionDescription};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 100;

const DURATION_TICK: Duration = Duration::from_secs(1);

pub struct Session<S, M, F>
where
    S: SignalingChannel,
    M: MediaDevices,
    F: TransportFactory,
    F::Transport: PeerTransport<Media = M::Media>,
{
    signaling: Arc<S>,
    devices: M,
    transports: F,
    constraints: MediaConstraints,
    ice_servers: Vec<String>,

    state: SessionState,
    counterpart: Option<ConnectionId>,
    joined_code: Option<String>,
    local_media: Option<M::Media>,
    transport: Option<F::Transport>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    remote_tracks: Vec<String>,
    connectivity: ConnectivityStatus,
    ticker: Option<JoinHandle<()>>,

    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<S, M, F> Session<S, M, F>
where
    S: SignalingChannel,
    M: MediaDevices,
    F: TransportFactory,
    F::Transport: PeerTransport<Media = M::Media>,
{
    pub fn new(signaling: Arc<S>, devices: M, transports: F, config: &ClientConfig) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            signaling,
            devices,
            transports,
            constraints: MediaConstraints::default(),
            ice_servers: config.ice_servers.clone(),
            state: SessionState::Idle,
            counterpart: None,
            joined_code: None,
            local_media: None,
            transport: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            remote_tracks: Vec::new(),
            connectivity: ConnectivityStatus::New,
            ticker: None,
            transport_tx,
            transport_rx,
            event_tx,
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.state.role()
    }

    pub fn local_id(&self) -> ConnectionId {
        self.signaling.local_id()
    }

    pub fn counterpart(&self) -> Option<ConnectionId> {
        self.counterpart
    }

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.connectivity
    }

    pub fn remote_track_count(&self) -> usize {
        self.remote_tracks.len()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn local_media(&self) -> Option<&M::Media> {
        self.local_media.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.local_media
            .as_ref()
            .and_then(|m| m.audio_enabled())
            .map(|enabled| !enabled)
            .unwrap_or(false)
    }

    /// Asks the relay for a call code, then captures local audio. The
    /// returned code is what the other party passes to [`Self::join_call`].
    pub async fn create_call(&mut self) -> Result<ConnectionId, SessionError> {
        self.ensure_idle()?;

        let code = self.signaling.create().await?;
        info!(%code, "call created");
        self.set_state(SessionState::Initiating { code });

        if let Err(err) = self.acquire_media().await {
            self.set_state(SessionState::Idle);
            return Err(err);
        }

        self.set_state(SessionState::AwaitingPeer { code });
        Ok(code)
    }

    /// Captures local audio and asks the relay to notify the owner of `code`.
    /// The session becomes the responder and waits for the offer.
    pub async fn join_call(&mut self, code: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let code = code.trim();
        if code.is_empty() {
            return Err(SessionError::InvalidCode);
        }

        self.acquire_media().await?;

        if let Err(err) = self.signaling.send(ClientMessage::Join {
            code: code.to_string(),
        }) {
            self.release_media();
            return Err(err.into());
        }

        info!(%code, "joining call");
        self.joined_code = Some(code.to_string());
        self.set_state(SessionState::Negotiating {
            role: Role::Responder,
        });
        Ok(())
    }

    /// Applies one frame from the relay.
    pub async fn handle_signal(&mut self, msg: ServerMessage) -> Result<(), SessionError> {
        match msg {
            ServerMessage::Ready { peer } => self.on_ready(peer).await,
            ServerMessage::Offer {
                description,
                caller,
            } => self.on_offer(description, caller).await,
            ServerMessage::Answer { description, from } => self.on_answer(description, from).await,
            ServerMessage::Candidate { candidate, from } => {
                self.on_remote_candidate(candidate, from).await
            }
            ServerMessage::NotFound { code } => self.on_not_found(code).await,
            ServerMessage::Error { message } => {
                warn!(%message, "relay rejected a frame");
                self.publish(SessionEvent::Error(message));
                Ok(())
            }
            // Consumed by the signaling client
            ServerMessage::Welcome { .. } | ServerMessage::Created { .. } => Ok(()),
        }
    }

    /// Applies one event reported by the transport.
    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Ended {
            debug!(?event, "transport event after end of call");
            return Ok(());
        }

        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                let Some(target) = self.counterpart else {
                    debug!("local candidate with no counterpart, dropping");
                    return Ok(());
                };
                self.signaling
                    .send(ClientMessage::Candidate { candidate, target })?;
            }
            TransportEvent::LocalCandidate(None) => {
                debug!("ICE gathering complete");
            }
            TransportEvent::RemoteTrack { track_id } => {
                info!(%track_id, "remote track received");
                self.remote_tracks.push(track_id.clone());
                self.publish(SessionEvent::RemoteTrack { track_id });
                if let SessionState::Negotiating { role } = self.state {
                    self.set_state(SessionState::Connected { role });
                    self.start_ticker();
                }
            }
            TransportEvent::Connectivity(status) => {
                debug!(?status, "transport connectivity changed");
                self.connectivity = status;
                self.publish(SessionEvent::Connectivity(status));
            }
        }
        Ok(())
    }

    /// Flips the outgoing audio gate and returns whether audio is now muted.
    /// Nothing is signaled and the transport is not renegotiated.
    pub fn toggle_mute(&mut self) -> bool {
        let Some(media) = self.local_media.as_ref() else {
            return false;
        };
        let Some(enabled) = media.audio_enabled() else {
            return false;
        };
        media.set_audio_enabled(!enabled);
        let muted = enabled;
        self.publish(SessionEvent::MuteChanged { muted });
        muted
    }

    /// Releases capture and transport and moves to `Ended`. Safe to call in
    /// any state and more than once. No goodbye is sent; the other side
    /// notices through its transport.
    pub async fn end_call(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.release_media();
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                warn!(%err, "closing transport failed");
            }
        }
        self.counterpart = None;
        self.joined_code = None;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.remote_tracks.clear();

        if self.state != SessionState::Ended {
            info!("call ended");
            self.set_state(SessionState::Ended);
        }
    }

    /// Pumps relay frames, transport events and UI commands until the call
    /// ends. Failures of individual operations are logged and published but
    /// do not stop the session. The call ends when the relay stream closes.
    pub async fn run(
        &mut self,
        signals: &mut mpsc::UnboundedReceiver<ServerMessage>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        while self.state != SessionState::Ended {
            tokio::select! {
                msg = signals.recv() => match msg {
                    Some(msg) => {
                        if let Err(err) = self.handle_signal(msg).await {
                            self.report(err);
                        }
                    }
                    None => {
                        info!("signaling connection closed");
                        self.end_call().await;
                    }
                },
                Some(event) = self.transport_rx.recv() => {
                    if let Err(err) = self.handle_transport_event(event).await {
                        self.report(err);
                    }
                }
                Some(command) = commands.recv() => match command {
                    SessionCommand::ToggleMute => {
                        self.toggle_mute();
                    }
                    SessionCommand::EndCall => self.end_call().await,
                },
            }
        }
    }

    /// Takes the next transport event without waiting, for callers that
    /// drive the session by hand instead of through [`Self::run`].
    pub fn try_next_transport_event(&mut self) -> Option<TransportEvent> {
        self.transport_rx.try_recv().ok()
    }

    async fn on_ready(&mut self, peer: ConnectionId) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::AwaitingPeer { .. }) {
            return Err(self.unexpected("ready"));
        }
        info!(%peer, "receiver ready, creating offer");

        self.counterpart = Some(peer);
        self.set_state(SessionState::Negotiating {
            role: Role::Initiator,
        });
        if let Err(err) = self.send_offer(peer).await {
            warn!(%err, "could not offer to receiver, ending call");
            self.end_call().await;
            return Err(err);
        }
        Ok(())
    }

    async fn send_offer(&mut self, peer: ConnectionId) -> Result<(), SessionError> {
        self.open_transport().await?;

        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        // The transport keeps what it generated; only the wire copy is rewritten
        let mut description = offer;
        request_high_quality_audio(&mut description);
        self.signaling.send(ClientMessage::Offer {
            description,
            target: peer,
        })?;
        debug!(target = %peer, "offer sent");
        Ok(())
    }

    async fn on_offer(
        &mut self,
        description: SessionDescription,
        caller: ConnectionId,
    ) -> Result<(), SessionError> {
        let responding = self.state
            == SessionState::Negotiating {
                role: Role::Responder,
            };
        if !responding || self.transport.is_some() {
            return Err(self.unexpected("offer"));
        }
        if !self.is_counterpart(caller) {
            return Err(SessionError::UnknownPeer(caller));
        }
        if self.local_media.is_none() {
            return Err(SessionError::MissingLocalMedia);
        }
        info!(%caller, "offer received, answering");

        self.counterpart = Some(caller);
        self.open_transport().await?;

        self.transport()?.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        let transport = self.transport()?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        let mut description = answer;
        request_high_quality_audio(&mut description);
        self.signaling.send(ClientMessage::Answer {
            description,
            target: caller,
        })?;
        debug!(target = %caller, "answer sent");
        Ok(())
    }

    async fn on_answer(
        &mut self,
        description: SessionDescription,
        from: ConnectionId,
    ) -> Result<(), SessionError> {
        if self.role() != Some(Role::Initiator) || self.remote_description_set {
            return Err(self.unexpected("answer"));
        }
        if self.counterpart != Some(from) {
            return Err(SessionError::UnknownPeer(from));
        }

        self.transport()?.set_remote_description(description).await?;
        self.remote_description_set = true;
        debug!(%from, "answer applied");
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        from: ConnectionId,
    ) -> Result<(), SessionError> {
        if !self.state.is_active() {
            return Err(self.unexpected("candidate"));
        }
        if !self.is_counterpart(from) {
            return Err(SessionError::UnknownPeer(from));
        }

        match self.transport.as_ref() {
            Some(transport) if self.remote_description_set => {
                transport.add_ice_candidate(candidate).await.map_err(|err| {
                    warn!(%err, "failed to add ICE candidate");
                    SessionError::from(err)
                })
            }
            _ => {
                debug!("transport not ready, queueing candidate");
                self.pending_candidates.push_back(candidate);
                Ok(())
            }
        }
    }

    /// Whether `from` may take part in this call: the settled counterpart,
    /// or before that, the owner of the code we joined. An initiator still
    /// waiting for `ready` has no one to check against.
    fn is_counterpart(&self, from: ConnectionId) -> bool {
        match (self.counterpart, self.joined_code.as_deref()) {
            (Some(counterpart), _) => counterpart == from,
            (None, Some(code)) => code.parse::<ConnectionId>().is_ok_and(|owner| owner == from),
            (None, None) => true,
        }
    }

    async fn on_not_found(&mut self, code: String) -> Result<(), SessionError> {
        if self.joined_code.as_deref() != Some(code.as_str()) || self.counterpart.is_some() {
            debug!(%code, "ignoring not_found for a code we are not waiting on");
            return Ok(());
        }
        warn!(%code, "call code not found");
        self.publish(SessionEvent::CallNotFound { code: code.clone() });
        self.end_call().await;
        Err(SessionError::CallNotFound(code))
    }

    async fn acquire_media(&mut self) -> Result<(), SessionError> {
        let media = self.devices.acquire(&self.constraints).await.map_err(|err| {
            warn!(%err, "media acquisition failed");
            err
        })?;
        self.publish(SessionEvent::LocalMedia {
            tracks: media.active_tracks(),
        });
        self.local_media = Some(media);
        Ok(())
    }

    fn release_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            media.stop();
        }
    }

    async fn open_transport(&mut self) -> Result<(), SessionError> {
        let media = self
            .local_media
            .as_ref()
            .ok_or(SessionError::MissingLocalMedia)?;
        let transport = self
            .transports
            .create(&self.ice_servers, self.transport_tx.clone())
            .await?;
        transport.add_local_media(media).await?;
        self.transport = Some(transport);
        Ok(())
    }

    fn transport(&self) -> Result<&F::Transport, SessionError> {
        self.transport
            .as_ref()
            .ok_or(SessionError::UnexpectedMessage {
                message: "negotiation step",
                state: "no transport is open",
            })
    }

    async fn flush_pending_candidates(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        while let Some(candidate) = self.pending_candidates.pop_front() {
            // One bad candidate must not take the rest down with it
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(%err, "failed to add queued ICE candidate");
            }
        }
    }

    fn start_ticker(&mut self) {
        if let Some(old) = self.ticker.take() {
            old.abort();
        }
        let events = self.event_tx.clone();
        self.ticker = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + DURATION_TICK;
            let mut interval = tokio::time::interval_at(start, DURATION_TICK);
            let mut seconds = 0;
            loop {
                interval.tick().await;
                seconds += 1;
                let _ = events.send(SessionEvent::Duration { seconds });
            }
        }));
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Ended => Err(SessionError::SessionFinished),
            _ => Err(SessionError::AlreadyActive),
        }
    }

    fn unexpected(&self, message: &'static str) -> SessionError {
        SessionError::UnexpectedMessage {
            message,
            state: self.state.name(),
        }
    }

    fn report(&self, err: SessionError) {
        warn!(%err, state = self.state.name(), "session operation failed");
        self.publish(SessionEvent::Error(err.to_string()));
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = self.state.name(), to = state.name(), "session state");
        self.state = state.clone();
        self.publish(SessionEvent::StateChanged(state));
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl<S, M, F> Drop for Session<S, M, F>
where
    S: SignalingChannel,
    M: MediaDevices,
    F: TransportFactory,
    F::Transport: PeerTransport<Media = M::Media>,
{
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.release_media();
    }
}

impl<S, M, F> std::fmt::Debug for Session<S, M, F>
where
    S: SignalingChannel,
    M: MediaDevices,
    F: TransportFactory,
    F::Transport: PeerTransport<Media = M::Media>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("counterpart", &self.counterpart)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("remote_tracks", &self.remote_tracks.len())
            .finish()
    }
}
