//! Peer Connection Adapter
//!
//! Wraps one native peer connection and addresses all of its negotiation
//! traffic to the other party's current transport identifier.

use super::media::LocalAudioTrack;
use crate::signaling::{ClientMessage, IceCandidate, OutboundSignal, SignalData, SignalingSink};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection already closed")]
    Closed,

    #[error("Remote party not yet known")]
    NoRemote,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Stream of remote media handed to the UI for playback
#[derive(Clone)]
pub struct RemoteStream {
    pub track_id: String,
    pub stream_id: String,
    pub track: Option<Arc<webrtc::track::track_remote::TrackRemote>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl PartialEq for RemoteStream {
    fn eq(&self, other: &Self) -> bool {
        self.track_id == other.track_id && self.stream_id == other.stream_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteStream),
    StateChanged(PeerConnectionState),
}

/// Event raised by a native peer connection, tagged with its call
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub call_id: String,
    pub kind: PeerEventKind,
}

/// Sender given to a native peer so its callbacks land in the event loop
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    call_id: String,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub fn new(call_id: impl Into<String>, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            call_id: call_id.into(),
            tx,
        }
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.tx.send(PeerEvent {
            call_id: self.call_id.clone(),
            kind,
        });
    }
}

// ============================================================================
// NATIVE PEER SEAM
// ============================================================================

/// The platform peer connection (WebRTC in production, mocks in tests)
#[async_trait]
pub trait NativePeer: Send + Sync {
    /// Creates an offer and applies it locally
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Applies a remote offer and returns the local answer
    async fn create_answer(&self, offer_sdp: String) -> Result<String, PeerError>;

    async fn set_remote_answer(&self, answer_sdp: String) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Factory for native peers
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        local: Option<&dyn LocalAudioTrack>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn NativePeer>, PeerError>;
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct PeerConnectionAdapter {
    call_id: String,
    native: Arc<dyn NativePeer>,
    sink: Arc<dyn SignalingSink>,
    remote_socket_id: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl PeerConnectionAdapter {
    pub fn new(
        call_id: impl Into<String>,
        native: Arc<dyn NativePeer>,
        sink: Arc<dyn SignalingSink>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            native,
            sink,
            remote_socket_id: None,
            pending_candidates: Vec::new(),
            closed: false,
        }
    }

    /// Call this connection belongs to
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Transport identifier all signaling is addressed to, once bound
    pub fn remote_socket_id(&self) -> Option<&str> {
        self.remote_socket_id.as_deref()
    }

    /// Whether `close` already ran
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Binds the other party's transport identifier and flushes candidates
    /// gathered before it was known
    pub fn bind_remote(&mut self, socket_id: impl Into<String>) {
        let socket_id = socket_id.into();
        tracing::debug!("Call {}: remote peer bound to {}", self.call_id, socket_id);
        self.remote_socket_id = Some(socket_id);

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.send_signal(SignalData::Candidate { candidate }) {
                tracing::error!("Failed to send buffered ICE candidate: {}", e);
            }
        }
    }

    /// Forwards a locally gathered candidate, buffering until the remote is
    /// bound
    pub fn forward_local_candidate(&mut self, candidate: IceCandidate) {
        if self.closed {
            return;
        }
        if self.remote_socket_id.is_none() {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.send_signal(SignalData::Candidate { candidate }) {
            tracing::error!("Failed to send ICE candidate: {}", e);
        }
    }

    /// Creates the offer and sends it to the bound remote
    pub async fn start_negotiation(&mut self) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::Closed);
        }
        let sdp = self.native.create_offer().await?;
        self.send_signal(SignalData::Offer { sdp })
    }

    /// Applies negotiation data from the other party
    pub async fn handle_remote_signal(&mut self, signal: SignalData) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::Closed);
        }
        match signal {
            SignalData::Offer { sdp } => {
                let answer = self.native.create_answer(sdp).await?;
                self.send_signal(SignalData::Answer { sdp: answer })
            }
            SignalData::Answer { sdp } => self.native.set_remote_answer(sdp).await,
            SignalData::Candidate { candidate } => self.native.add_ice_candidate(candidate).await,
        }
    }

    /// Releases the native connection; later calls are no-ops
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();
        if let Err(e) = self.native.close().await {
            tracing::warn!("Call {}: closing peer connection failed: {}", self.call_id, e);
        }
        tracing::debug!("Call {}: peer connection closed", self.call_id);
    }

    fn send_signal(&self, signal: SignalData) -> Result<(), PeerError> {
        let target = self.remote_socket_id.clone().ok_or(PeerError::NoRemote)?;
        self.sink
            .send(ClientMessage::Signal(OutboundSignal {
                target_socket_id: target,
                signal,
            }))
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }
}

impl std::fmt::Debug for PeerConnectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionAdapter")
            .field("call_id", &self.call_id)
            .field("remote_socket_id", &self.remote_socket_id)
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
