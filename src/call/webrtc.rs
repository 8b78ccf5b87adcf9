//! WebRTC backend for the peer connection adapter
//!
//! Builds `RTCPeerConnection`s with the default codec set (or PCMU alone for
//! the native audio path) and interceptors, and turns their callbacks into
//! [`PeerEvent`](super::peer::PeerEvent)s.

use super::media::LocalAudioTrack;
use super::peer::{
    NativePeer, PeerConnectionState, PeerConnector, PeerError, PeerEventKind, PeerEventSender,
    RemoteStream,
};
use crate::config::IceServer;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Creates WebRTC peer connections using the configured ICE servers
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    pcmu_only: bool,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[IceServer]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();
        Self {
            ice_servers,
            pcmu_only: false,
        }
    }

    /// Negotiates G.711 μ-law only, so the remote side sends audio the
    /// native player can decode
    pub fn pcmu_only(mut self) -> Self {
        self.pcmu_only = true;
        self
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        if self.pcmu_only {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_PCMU.to_string(),
                            clock_rate: 8000,
                            ..Default::default()
                        },
                        payload_type: 0,
                        ..Default::default()
                    },
                    RTPCodecType::Audio,
                )
                .map_err(webrtc_err)?;
        } else {
            media_engine.register_default_codecs().map_err(webrtc_err)?;
        }

        // RTCP reports, NACK, TWCC
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        local: Option<&dyn LocalAudioTrack>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn NativePeer>, PeerError> {
        let pc = self.build_peer_connection().await?;
        install_handlers(&pc, events);

        let attached = match local.and_then(|t| t.rtc_track()) {
            Some(track) => pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map(|_| ()),
            None => pc
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map(|_| ()),
        };

        if let Err(e) = attached {
            let _ = pc.close().await;
            return Err(webrtc_err(e));
        }

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Routes connection callbacks into the session's event loop
fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                Some(PeerConnectionState::Connecting)
            }
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            state_events.emit(PeerEventKind::StateChanged(state));
        }

        Box::pin(async {})
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events.emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_events = events;
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!("Received remote track: {:?}", track.codec());
        track_events.emit(PeerEventKind::RemoteTrack(RemoteStream {
            track_id: track.id(),
            stream_id: track.stream_id(),
            track: Some(track),
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER
// ============================================================================

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl NativePeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, offer_sdp: String) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("state", &self.pc.connection_state())
            .finish()
    }
}
