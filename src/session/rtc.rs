//! Peer transport and local audio track backed by webrtc-rs.
//!
//! Encoding is left to the application: it feeds already-encoded Opus frames
//! into [`RtcLocalMedia::write_sample`], which drops them while muted.

use super::media::{
    ConnectivityStatus, LocalMedia, MediaConstraints, MediaDevices, PeerTransport,
    TransportEvent, TransportFactory,
};
use crate::error::{MediaError, TransportError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

fn transport_err(e: webrtc::Error) -> TransportError {
    TransportError(e.to_string())
}

/// A local Opus track with a mute gate.
pub struct RtcLocalMedia {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalMedia {
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Writes one encoded frame unless muted or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Acquire) || !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.track.write_sample(sample).await.map_err(transport_err)
    }
}

impl LocalMedia for RtcLocalMedia {
    fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::Release);
        true
    }

    fn audio_enabled(&self) -> Option<bool> {
        Some(self.enabled.load(Ordering::Acquire))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn active_tracks(&self) -> usize {
        if self.stopped.load(Ordering::Acquire) { 0 } else { 1 }
    }
}

#[derive(Debug, Default)]
pub struct RtcMediaDevices;

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    type Media = RtcLocalMedia;

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<RtcLocalMedia, MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: constraints.sample_rate,
                channels: constraints.channel_count,
                ..Default::default()
            },
            "audio".to_owned(),
            "callcode".to_owned(),
        ));
        Ok(RtcLocalMedia {
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

#[derive(Debug, Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<RtcTransport, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_err)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(transport_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // An empty list means host candidates only
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(transport_err)?,
        );
        register_handlers(&pc, events);
        Ok(RtcTransport { pc })
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<TransportEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let event = match candidate.map(|c| c.to_json()) {
            Some(Ok(init)) => Some(TransportEvent::LocalCandidate(Some(IceCandidate {
                candidate: init.candidate,
                mid: init.sdp_mid,
                m_line_index: init.sdp_mline_index,
            }))),
            Some(Err(e)) => {
                tracing::warn!("Failed to serialize local candidate: {}", e);
                None
            }
            None => Some(TransportEvent::LocalCandidate(None)),
        };
        if let Some(event) = event {
            let _ = candidate_events.send(event);
        }
        Box::pin(async {})
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let _ = track_events.send(TransportEvent::RemoteTrack {
            track_id: track.id(),
        });
        Box::pin(async {})
    }));

    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        let status = match s {
            RTCPeerConnectionState::Connecting => Some(ConnectivityStatus::Checking),
            RTCPeerConnectionState::Connected => Some(ConnectivityStatus::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectivityStatus::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectivityStatus::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectivityStatus::Closed),
            RTCPeerConnectionState::New => Some(ConnectivityStatus::New),
            _ => None,
        };
        if let Some(status) = status {
            let _ = events.send(TransportEvent::Connectivity(status));
        }
        Box::pin(async {})
    }));
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(transport_err)
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    type Media = RtcLocalMedia;

    async fn add_local_media(&self, media: &RtcLocalMedia) -> Result<(), TransportError> {
        self.pc
            .add_track(media.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_err)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(transport_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.mid,
                sdp_mline_index: candidate.m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(transport_err)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(transport_err)
    }
}
