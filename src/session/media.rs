//! Collaborators the session drives but does not implement: local capture
//! and the peer transport.

use crate::error::{MediaError, TransportError};
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capture constraints requested from the audio device. Defaults ask for
/// unprocessed 48 kHz stereo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub auto_gain_control: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub channel_count: u16,
    pub sample_rate: u32,
    pub sample_size: u16,
    /// Always false; calls are voice only.
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            auto_gain_control: false,
            echo_cancellation: false,
            noise_suppression: false,
            channel_count: 2,
            sample_rate: 48_000,
            sample_size: 16,
            video: false,
        }
    }
}

/// Connectivity of the peer transport, reported for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Things the transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A locally gathered candidate; `None` once gathering is complete.
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack { track_id: String },
    Connectivity(ConnectivityStatus),
}

/// A captured local stream.
pub trait LocalMedia: Send + Sync + 'static {
    /// Gates the outgoing audio track without touching the transport.
    /// Returns false when the stream has no audio track.
    fn set_audio_enabled(&self, enabled: bool) -> bool;

    fn audio_enabled(&self) -> Option<bool>;

    /// Stops every track. Calling it again has no effect.
    fn stop(&self);

    fn active_tracks(&self) -> usize;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    type Media: LocalMedia;

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Self::Media, MediaError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type Media: LocalMedia;

    async fn add_local_media(&self, media: &Self::Media) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds a fresh transport per call attempt. Events from the transport are
/// pushed into `events`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: PeerTransport;

    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self::Transport, TransportError>;
}
