//! Call Session Manager
//!
//! Drives the single call a client may have at a time:
//! `idle → calling | ringing → in-call → idle`.
//!
//! The manager is the only owner of the local microphone track and the peer
//! connection; every transition that ends a call releases both.

use super::media::{LocalAudioTrack, MediaDevices, MediaError};
use super::peer::{
    PeerConnectionAdapter, PeerConnectionState, PeerConnector, PeerError, PeerEvent,
    PeerEventKind, PeerEventSender, RemoteStream,
};
use crate::config::Identity;
use crate::signaling::{
    CallAcceptedPayload, CallIdPayload, CallRejectedPayload, CallReplyPayload, ClientMessage,
    EndCallPayload, InboundSignal, IncomingCallPayload, InitiateCallPayload, ServerMessage,
    SignalData, SignalingError, SignalingSink,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Reason sent when a second call arrives while we are busy
pub const BUSY_REASON: &str = "busy";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("No call targets selected")]
    NoTargets,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call to answer")]
    NotRinging,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Call client is shut down")]
    Shutdown,
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        CallError::Signaling(e.to_string())
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outbound, waiting for an answer
    Calling,
    /// Inbound, waiting for the local user
    Ringing,
    InCall,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Calling => write!(f, "calling"),
            Self::Ringing => write!(f, "ringing"),
            Self::InCall => write!(f, "in-call"),
        }
    }
}

/// The one active call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: String,
    pub participants: Vec<String>,
    pub initiator_id: String,
    pub caller_name: String,
    pub state: CallState,
    pub is_initiator: bool,
    /// Other party's current transport identifier
    pub peer_socket_id: Option<String>,
    /// Outbound targets that have neither accepted nor declined yet
    pub pending: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    TransportLost,
    PeerFailed,
    MediaUnavailable,
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    Incoming {
        call_id: String,
        caller_id: String,
        caller_name: String,
    },
    /// A second call was turned away because we were busy
    BusyRejected { call_id: String, caller_id: String },
    /// Every target declined the outbound call
    Rejected {
        call_id: String,
        reason: Option<String>,
    },
    /// One target of a multi-target call declined; the others keep ringing
    Declined {
        call_id: String,
        callee_id: Option<String>,
        remaining: usize,
    },
    Ended { call_id: String, reason: EndReason },
    RemoteStream(RemoteStream),
    Error(String),
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct CallSessionManager {
    identity: Identity,
    sink: Arc<dyn SignalingSink>,
    media: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
    state_tx: watch::Sender<CallState>,
    session: Option<CallSession>,
    local_track: Option<Box<dyn LocalAudioTrack>>,
    peer: Option<PeerConnectionAdapter>,
}

impl CallSessionManager {
    pub fn new(
        identity: Identity,
        sink: Arc<dyn SignalingSink>,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        Self {
            identity,
            sink,
            media,
            connector,
            peer_events,
            events,
            state_tx,
            session: None,
            local_track: None,
            peer: None,
        }
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    /// The active call, if any
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    /// Starts an outbound call and returns its id
    pub async fn initiate_call(&mut self, targets: Vec<String>) -> Result<String, CallError> {
        let mut unique: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets {
            let target = target.trim().to_string();
            if !target.is_empty() && target != self.identity.user_id && !unique.contains(&target)
            {
                unique.push(target);
            }
        }
        if unique.is_empty() {
            return Err(CallError::NoTargets);
        }
        if self.session.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Call {}: calling {:?}", call_id, unique);

        let mut track = self.acquire_media().await?;
        let native = match self
            .connector
            .connect(
                Some(track.as_ref()),
                PeerEventSender::new(call_id.clone(), self.peer_events.clone()),
            )
            .await
        {
            Ok(native) => native,
            Err(e) => {
                track.stop();
                self.emit(CallEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };
        let mut peer = PeerConnectionAdapter::new(call_id.clone(), native, Arc::clone(&self.sink));

        let initiate = ClientMessage::InitiateCall(InitiateCallPayload {
            target_user_ids: unique.clone(),
            caller_id: self.identity.user_id.clone(),
            caller_name: self.identity.caller_name().to_string(),
            call_id: call_id.clone(),
        });
        if let Err(e) = self.sink.send(initiate) {
            peer.close().await;
            track.stop();
            self.emit(CallEvent::Error(e.to_string()));
            return Err(e.into());
        }

        self.local_track = Some(track);
        self.peer = Some(peer);
        self.session = Some(CallSession {
            call_id: call_id.clone(),
            pending: unique.clone(),
            participants: unique,
            initiator_id: self.identity.user_id.clone(),
            caller_name: self.identity.caller_name().to_string(),
            state: CallState::Calling,
            is_initiator: true,
            peer_socket_id: None,
            started_at: Utc::now(),
        });
        self.set_state(CallState::Calling);

        Ok(call_id)
    }

    /// Answers the ringing call
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        let (call_id, caller_socket_id) = match &self.session {
            Some(s) if s.state == CallState::Ringing => (
                s.call_id.clone(),
                s.peer_socket_id.clone().unwrap_or_default(),
            ),
            Some(_) => return Err(CallError::NotRinging),
            None => return Err(CallError::NoActiveCall),
        };

        let mut track = match self.acquire_media().await {
            Ok(track) => track,
            Err(e) => {
                self.teardown(EndReason::MediaUnavailable).await;
                return Err(e);
            }
        };

        let native = match self
            .connector
            .connect(
                Some(track.as_ref()),
                PeerEventSender::new(call_id.clone(), self.peer_events.clone()),
            )
            .await
        {
            Ok(native) => native,
            Err(e) => {
                track.stop();
                self.emit(CallEvent::Error(e.to_string()));
                self.teardown(EndReason::PeerFailed).await;
                return Err(e.into());
            }
        };
        self.local_track = Some(track);

        let mut peer = PeerConnectionAdapter::new(call_id.clone(), native, Arc::clone(&self.sink));
        peer.bind_remote(caller_socket_id.clone());
        self.peer = Some(peer);

        let accept = ClientMessage::AcceptCall(CallReplyPayload {
            call_id: call_id.clone(),
            caller_socket_id,
            reason: None,
        });
        if let Err(e) = self.sink.send(accept) {
            self.emit(CallEvent::Error(e.to_string()));
            self.teardown(EndReason::TransportLost).await;
            return Err(e.into());
        }

        if let Some(session) = self.session.as_mut() {
            session.state = CallState::InCall;
        }
        tracing::info!("Call {}: accepted", call_id);
        self.set_state(CallState::InCall);
        Ok(())
    }

    /// Declines the ringing call
    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        let (call_id, caller_socket_id) = match &self.session {
            Some(s) if s.state == CallState::Ringing => (
                s.call_id.clone(),
                s.peer_socket_id.clone().unwrap_or_default(),
            ),
            Some(_) => return Err(CallError::NotRinging),
            None => return Err(CallError::NoActiveCall),
        };

        tracing::info!("Call {}: rejecting", call_id);
        let sent = self.sink.send(ClientMessage::RejectCall(CallReplyPayload {
            call_id,
            caller_socket_id,
            reason: None,
        }));
        self.teardown(EndReason::Rejected).await;
        sent.map_err(CallError::from)
    }

    /// Hangs up (or cancels an unanswered outbound call)
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let (call_id, state) = match &self.session {
            Some(s) => (s.call_id.clone(), s.state),
            None => return Err(CallError::NoActiveCall),
        };
        if state == CallState::Ringing {
            return self.reject_call().await;
        }

        tracing::info!("Call {}: hanging up", call_id);
        let sent = self
            .sink
            .send(ClientMessage::EndCall(EndCallPayload::all(call_id)));
        if let Err(e) = &sent {
            tracing::warn!("Failed to send end-call: {}", e);
        }
        self.teardown(EndReason::LocalHangup).await;
        sent.map_err(CallError::from)
    }

    // ========================================================================
    // INBOUND MESSAGES
    // ========================================================================

    /// Applies a server push; presence updates are not handled here
    pub async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::IncomingCall(p) => self.handle_incoming_call(p),
            ServerMessage::CallAccepted(p) => self.handle_call_accepted(p).await,
            ServerMessage::CallRejected(p) => self.handle_call_rejected(p).await,
            ServerMessage::CallEnded(p) => self.handle_call_ended(p).await,
            ServerMessage::Signal(s) => self.handle_signal(s).await,
            ServerMessage::OnlineUsers(_) => {}
        }
    }

    fn handle_incoming_call(&mut self, p: IncomingCallPayload) {
        match &self.session {
            None => {
                tracing::info!(
                    "Call {}: incoming from {} ({})",
                    p.call_id,
                    p.caller_name,
                    p.caller_id
                );
                self.session = Some(CallSession {
                    call_id: p.call_id.clone(),
                    participants: vec![p.caller_id.clone(), self.identity.user_id.clone()],
                    initiator_id: p.caller_id.clone(),
                    caller_name: p.caller_name.clone(),
                    state: CallState::Ringing,
                    is_initiator: false,
                    peer_socket_id: Some(p.caller_socket_id),
                    pending: Vec::new(),
                    started_at: Utc::now(),
                });
                self.set_state(CallState::Ringing);
                self.emit(CallEvent::Incoming {
                    call_id: p.call_id,
                    caller_id: p.caller_id,
                    caller_name: p.caller_name,
                });
            }
            Some(s) if s.call_id == p.call_id => {
                tracing::debug!("Call {}: duplicate incoming-call ignored", p.call_id);
            }
            Some(s) => {
                tracing::info!(
                    "Call {}: busy with {}, auto-rejecting caller {}",
                    p.call_id,
                    s.call_id,
                    p.caller_id
                );
                let reject = ClientMessage::RejectCall(CallReplyPayload {
                    call_id: p.call_id.clone(),
                    caller_socket_id: p.caller_socket_id,
                    reason: Some(BUSY_REASON.to_string()),
                });
                if let Err(e) = self.sink.send(reject) {
                    tracing::warn!("Failed to send busy rejection: {}", e);
                }
                self.emit(CallEvent::BusyRejected {
                    call_id: p.call_id,
                    caller_id: p.caller_id,
                });
            }
        }
    }

    async fn handle_call_accepted(&mut self, p: CallAcceptedPayload) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("Call {}: call-accepted without session", p.call_id);
            return;
        };
        if session.call_id != p.call_id {
            tracing::debug!("Call {}: call-accepted for another call", p.call_id);
            return;
        }
        if session.state != CallState::Calling {
            let late = session.is_initiator
                && session.peer_socket_id.as_deref() != Some(p.callee_socket_id.as_str());
            if late {
                // Another target already answered; release this one
                tracing::info!(
                    "Call {}: already answered, releasing {}",
                    p.call_id,
                    p.callee_socket_id
                );
                let release = EndCallPayload::targeted(p.call_id, p.callee_socket_id);
                if let Err(e) = self.sink.send(ClientMessage::EndCall(release)) {
                    tracing::warn!("Failed to release late callee: {}", e);
                }
            } else {
                tracing::debug!("Call {}: duplicate call-accepted ignored", p.call_id);
            }
            return;
        }

        session.state = CallState::InCall;
        session.peer_socket_id = Some(p.callee_socket_id.clone());
        session.pending.clear();
        if let Some(callee) = p.callee_id {
            if session.participants.contains(&callee) {
                session.participants.retain(|id| id == &callee);
            }
        }
        tracing::info!("Call {}: accepted by {}", p.call_id, p.callee_socket_id);

        let negotiated = match self.peer.as_mut() {
            Some(peer) => {
                peer.bind_remote(p.callee_socket_id);
                peer.start_negotiation().await
            }
            None => Err(PeerError::Closed),
        };
        self.set_state(CallState::InCall);

        if let Err(e) = negotiated {
            self.fail_call(e).await;
        }
    }

    async fn handle_call_rejected(&mut self, p: CallRejectedPayload) {
        let session = match self.session.as_mut() {
            Some(s) if s.call_id == p.call_id && s.state == CallState::Calling => s,
            _ => {
                tracing::debug!("Call {}: stale call-rejected ignored", p.call_id);
                return;
            }
        };

        // Without a callee id each rejection counts for one target
        let removed = match &p.callee_id {
            Some(callee) => {
                let before = session.pending.len();
                session.pending.retain(|id| id != callee);
                session.pending.len() < before
            }
            None => session.pending.pop().is_some(),
        };
        if !removed {
            tracing::debug!("Call {}: repeated call-rejected ignored", p.call_id);
            return;
        }

        let remaining = session.pending.len();
        if remaining > 0 {
            tracing::info!(
                "Call {}: declined by {}, {} target(s) still ringing",
                p.call_id,
                p.callee_id.as_deref().unwrap_or("a callee"),
                remaining
            );
            self.emit(CallEvent::Declined {
                call_id: p.call_id,
                callee_id: p.callee_id,
                remaining,
            });
            return;
        }

        tracing::info!("Call {}: rejected ({:?})", p.call_id, p.reason);
        self.emit(CallEvent::Rejected {
            call_id: p.call_id,
            reason: p.reason,
        });
        self.teardown(EndReason::Rejected).await;
    }

    async fn handle_call_ended(&mut self, p: CallIdPayload) {
        match &self.session {
            Some(s) if s.call_id == p.call_id => {
                tracing::info!("Call {}: ended by remote", p.call_id);
                self.teardown(EndReason::RemoteHangup).await;
            }
            _ => tracing::debug!("Call {}: stale call-ended ignored", p.call_id),
        }
    }

    async fn handle_signal(&mut self, inbound: InboundSignal) {
        let Some(peer) = self.peer.as_mut() else {
            tracing::debug!("Signal without peer connection dropped");
            return;
        };

        if peer.remote_socket_id().is_none() {
            if let Some(from) = inbound.from_socket_id {
                peer.bind_remote(from);
            }
        }

        let is_description = !matches!(inbound.signal, SignalData::Candidate { .. });
        if let Err(e) = peer.handle_remote_signal(inbound.signal).await {
            if is_description {
                self.fail_call(e).await;
            } else {
                tracing::warn!("Failed to add remote ICE candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // PEER & TRANSPORT EVENTS
    // ========================================================================

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self.session.as_ref().map(|s| s.call_id.as_str());
        if current != Some(event.call_id.as_str()) {
            tracing::trace!("Dropping peer event of finished call {}", event.call_id);
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.forward_local_candidate(candidate);
                }
            }
            PeerEventKind::RemoteTrack(stream) => {
                tracing::info!("Call {}: remote audio {}", event.call_id, stream.track_id);
                self.emit(CallEvent::RemoteStream(stream));
            }
            PeerEventKind::StateChanged(PeerConnectionState::Failed) => {
                self.fail_call(PeerError::WebRTC("connection failed".to_string()))
                    .await;
            }
            PeerEventKind::StateChanged(state) => {
                tracing::debug!("Call {}: peer connection {:?}", event.call_id, state);
            }
        }
    }

    /// The signaling connection dropped; peer addressing is gone with it
    pub async fn handle_transport_lost(&mut self) {
        if let Some(session) = &self.session {
            tracing::warn!(
                "Call {}: signaling connection lost, ending call",
                session.call_id
            );
            self.teardown(EndReason::TransportLost).await;
        }
    }

    /// Releases everything; used on shutdown
    pub async fn shutdown(&mut self) {
        if self.session.is_some() {
            let _ = self.end_call().await;
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn acquire_media(&mut self) -> Result<Box<dyn LocalAudioTrack>, CallError> {
        match self.media.acquire_microphone().await {
            Ok(track) => {
                tracing::debug!("Microphone acquired: {}", track.id());
                Ok(track)
            }
            Err(e) => {
                tracing::error!("Failed to acquire microphone: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Best-effort `end-call`, error notification, local teardown
    async fn fail_call(&mut self, error: PeerError) {
        tracing::error!("Call failed: {}", error);
        if let Some(s) = &self.session {
            if matches!(s.state, CallState::Calling | CallState::InCall) {
                let _ = self
                    .sink
                    .send(ClientMessage::EndCall(EndCallPayload::all(s.call_id.clone())));
            }
        }
        self.emit(CallEvent::Error(error.to_string()));
        self.teardown(EndReason::PeerFailed).await;
    }

    async fn teardown(&mut self, reason: EndReason) {
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(mut track) = self.local_track.take() {
            track.stop();
        }
        if let Some(session) = self.session.take() {
            self.emit(CallEvent::Ended {
                call_id: session.call_id,
                reason,
            });
        }
        self.set_state(CallState::Idle);
    }

    fn set_state(&self, state: CallState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Call state: {} -> {}", previous, state);
            self.emit(CallEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("state", &self.state())
            .field("session", &self.session)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{MockConnector, MockDevices, RecordingSink};
    use crate::signaling::{IceCandidate, OutboundSignal};

    struct Harness {
        manager: CallSessionManager,
        sink: Arc<RecordingSink>,
        devices: Arc<MockDevices>,
        connector: Arc<MockConnector>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = Arc::new(RecordingSink::default());
            let devices = Arc::new(MockDevices::default());
            let connector = Arc::new(MockConnector::default());
            let (peer_tx, peer_events) = mpsc::unbounded_channel();
            let (event_tx, events) = mpsc::unbounded_channel();
            let manager = CallSessionManager::new(
                Identity::new("u1", "ER", "nurse").with_display_name("Nurse Ada"),
                sink.clone(),
                devices.clone(),
                connector.clone(),
                peer_tx,
                event_tx,
            );
            Self {
                manager,
                sink,
                devices,
                connector,
                events,
                peer_events,
            }
        }

        fn drain_events(&mut self) -> Vec<CallEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        async fn ring(&mut self, call_id: &str) {
            self.manager
                .handle_server_message(ServerMessage::IncomingCall(IncomingCallPayload {
                    call_id: call_id.to_string(),
                    caller_id: "u7".to_string(),
                    caller_name: "Dr. Kim".to_string(),
                    caller_socket_id: "sock-u7".to_string(),
                }))
                .await;
        }

        async fn accepted(&mut self, call_id: &str) {
            self.manager
                .handle_server_message(ServerMessage::CallAccepted(CallAcceptedPayload {
                    call_id: call_id.to_string(),
                    callee_socket_id: "sock-u2".to_string(),
                    callee_id: Some("u2".to_string()),
                }))
                .await;
        }
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_target_list_is_refused() {
        let mut h = Harness::new();

        let result = h.manager.initiate_call(Vec::new()).await;
        assert_eq!(result, Err(CallError::NoTargets));

        let result = h.manager.initiate_call(targets(&["", "u1"])).await;
        assert_eq!(result, Err(CallError::NoTargets));

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("initiate-call"), 0);
        assert_eq!(h.devices.acquired(), 0);
        assert_eq!(h.connector.created(), 0);
    }

    #[tokio::test]
    async fn test_initiate_call_enters_calling() {
        let mut h = Harness::new();

        let call_id = h
            .manager
            .initiate_call(targets(&["u2", "u3", "u2"]))
            .await
            .unwrap();

        assert_eq!(h.manager.state(), CallState::Calling);
        let session = h.manager.session().unwrap();
        assert!(session.is_initiator);
        assert_eq!(session.participants, targets(&["u2", "u3"]));

        match h.sink.sent().as_slice() {
            [ClientMessage::InitiateCall(p)] => {
                assert_eq!(p.call_id, call_id);
                assert_eq!(p.caller_id, "u1");
                assert_eq!(p.caller_name, "Nurse Ada");
                assert_eq!(p.target_user_ids, targets(&["u2", "u3"]));
            }
            other => panic!("unexpected messages: {:?}", other),
        }
        assert_eq!(h.devices.acquired(), 1);
        assert_eq!(h.connector.created(), 1);
    }

    #[tokio::test]
    async fn test_second_initiate_while_calling_fails() {
        let mut h = Harness::new();
        h.manager.initiate_call(targets(&["u2"])).await.unwrap();

        let result = h.manager.initiate_call(targets(&["u3"])).await;
        assert_eq!(result, Err(CallError::AlreadyInCall));
        assert_eq!(h.sink.count("initiate-call"), 1);
    }

    #[tokio::test]
    async fn test_rejected_call_releases_media_and_allows_retry() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        let peer = h.connector.last_peer().unwrap();

        h.manager
            .handle_server_message(ServerMessage::CallRejected(CallRejectedPayload {
                call_id: call_id.clone(),
                reason: Some("declined".to_string()),
                callee_id: None,
            }))
            .await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(peer.close_count(), 1);
        assert!(h.drain_events().contains(&CallEvent::Rejected {
            call_id,
            reason: Some("declined".to_string()),
        }));

        h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        assert_eq!(h.manager.state(), CallState::Calling);
        assert_eq!(h.sink.count("initiate-call"), 2);
    }

    #[tokio::test]
    async fn test_call_accepted_sends_offer_to_callee() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2", "u3"])).await.unwrap();

        h.accepted(&call_id).await;

        assert_eq!(h.manager.state(), CallState::InCall);
        let session = h.manager.session().unwrap();
        assert_eq!(session.peer_socket_id.as_deref(), Some("sock-u2"));
        assert_eq!(session.participants, targets(&["u2"]));

        let offers: Vec<_> = h
            .sink
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Signal(OutboundSignal {
                    target_socket_id,
                    signal: SignalData::Offer { sdp },
                }) => Some((target_socket_id, sdp)),
                _ => None,
            })
            .collect();
        assert_eq!(
            offers,
            vec![("sock-u2".to_string(), "v=0 mock-offer".to_string())]
        );
    }

    #[tokio::test]
    async fn test_late_acceptor_is_released() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2", "u3"])).await.unwrap();
        h.accepted(&call_id).await;

        h.manager
            .handle_server_message(ServerMessage::CallAccepted(CallAcceptedPayload {
                call_id: call_id.clone(),
                callee_socket_id: "sock-u3".to_string(),
                callee_id: Some("u3".to_string()),
            }))
            .await;

        assert_eq!(h.sink.count("signal"), 1);
        assert_eq!(
            h.sink.sent().last(),
            Some(&ClientMessage::EndCall(EndCallPayload::targeted(
                call_id.clone(),
                "sock-u3"
            )))
        );
        assert_eq!(h.manager.state(), CallState::InCall);
        assert_eq!(
            h.manager.session().unwrap().peer_socket_id.as_deref(),
            Some("sock-u2")
        );

        // A repeated acceptance from the bound callee releases nobody
        h.accepted(&call_id).await;
        assert_eq!(h.sink.count("end-call"), 1);
    }

    #[tokio::test]
    async fn test_one_decline_keeps_other_targets_ringing() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2", "u3"])).await.unwrap();
        let peer = h.connector.last_peer().unwrap();
        h.drain_events();

        h.manager
            .handle_server_message(ServerMessage::CallRejected(CallRejectedPayload {
                call_id: call_id.clone(),
                reason: None,
                callee_id: None,
            }))
            .await;

        assert_eq!(h.manager.state(), CallState::Calling);
        assert_eq!(h.sink.count("end-call"), 0);
        assert_eq!(peer.close_count(), 0);
        assert_eq!(
            h.drain_events(),
            vec![CallEvent::Declined {
                call_id: call_id.clone(),
                callee_id: None,
                remaining: 1,
            }]
        );

        h.manager
            .handle_server_message(ServerMessage::CallAccepted(CallAcceptedPayload {
                call_id,
                callee_socket_id: "sock-u3".to_string(),
                callee_id: Some("u3".to_string()),
            }))
            .await;

        assert_eq!(h.manager.state(), CallState::InCall);
        let session = h.manager.session().unwrap();
        assert_eq!(session.peer_socket_id.as_deref(), Some("sock-u3"));
        assert_eq!(session.participants, targets(&["u3"]));
        assert!(h.sink.sent().iter().any(|m| matches!(
            m,
            ClientMessage::Signal(OutboundSignal {
                target_socket_id,
                signal: SignalData::Offer { .. },
            }) if target_socket_id == "sock-u3"
        )));
    }

    #[tokio::test]
    async fn test_call_ends_when_every_target_declines() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2", "u3"])).await.unwrap();

        for callee in ["u3", "u3", "u2"] {
            h.manager
                .handle_server_message(ServerMessage::CallRejected(CallRejectedPayload {
                    call_id: call_id.clone(),
                    reason: Some("declined".to_string()),
                    callee_id: Some(callee.to_string()),
                }))
                .await;
        }

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.devices.stops(), 1);
        let events = h.drain_events();
        let declined = events
            .iter()
            .filter(|e| matches!(e, CallEvent::Declined { .. }))
            .count();
        assert_eq!(declined, 1);
        assert!(events.contains(&CallEvent::Ended {
            call_id,
            reason: EndReason::Rejected,
        }));
    }

    #[tokio::test]
    async fn test_end_call_once_emits_one_end_and_one_close() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        h.accepted(&call_id).await;
        let peer = h.connector.last_peer().unwrap();

        h.manager.end_call().await.unwrap();

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("end-call"), 1);
        assert_eq!(peer.close_count(), 1);
        assert_eq!(h.devices.stops(), 1);

        assert_eq!(h.manager.end_call().await, Err(CallError::NoActiveCall));
        assert_eq!(h.sink.count("end-call"), 1);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_calling_sends_end_call() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();

        h.manager.end_call().await.unwrap();

        assert_eq!(
            h.sink.sent().last(),
            Some(&ClientMessage::EndCall(EndCallPayload::all(call_id)))
        );
        assert_eq!(h.manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_media_failure_rolls_back_to_idle() {
        let mut h = Harness::new();
        h.devices.deny();

        let result = h.manager.initiate_call(targets(&["u2"])).await;

        assert_eq!(
            result,
            Err(CallError::Media(MediaError::PermissionDenied))
        );
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.connector.created(), 0);
        assert!(h.sink.sent().is_empty());
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, CallEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_peer_creation_failure_releases_media() {
        let mut h = Harness::new();
        h.connector.set_failing(true);

        let result = h.manager.initiate_call(targets(&["u2"])).await;

        assert!(matches!(result, Err(CallError::Peer(_))));
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_offline_transport_aborts_initiate() {
        let mut h = Harness::new();
        h.sink.set_offline(true);

        let result = h.manager.initiate_call(targets(&["u2"])).await;

        assert!(matches!(result, Err(CallError::Signaling(_))));
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.connector.last_peer().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_incoming_accept_and_answer() {
        let mut h = Harness::new();
        h.ring("c-42").await;

        assert_eq!(h.manager.state(), CallState::Ringing);
        assert_eq!(h.devices.acquired(), 0);
        assert!(h.drain_events().contains(&CallEvent::Incoming {
            call_id: "c-42".to_string(),
            caller_id: "u7".to_string(),
            caller_name: "Dr. Kim".to_string(),
        }));

        h.manager.accept_call().await.unwrap();
        assert_eq!(h.manager.state(), CallState::InCall);
        assert_eq!(
            h.sink.sent(),
            vec![ClientMessage::AcceptCall(CallReplyPayload {
                call_id: "c-42".to_string(),
                caller_socket_id: "sock-u7".to_string(),
                reason: None,
            })]
        );

        h.manager
            .handle_server_message(ServerMessage::Signal(InboundSignal {
                from_socket_id: Some("sock-u7".to_string()),
                signal: SignalData::Offer {
                    sdp: "v=0 remote".to_string(),
                },
            }))
            .await;

        let peer = h.connector.last_peer().unwrap();
        assert_eq!(peer.remote_offers(), vec!["v=0 remote".to_string()]);
        assert_eq!(
            h.sink.sent().last(),
            Some(&ClientMessage::Signal(OutboundSignal {
                target_socket_id: "sock-u7".to_string(),
                signal: SignalData::Answer {
                    sdp: "v=0 mock-answer".to_string()
                },
            }))
        );
    }

    #[tokio::test]
    async fn test_reject_incoming_call() {
        let mut h = Harness::new();
        h.ring("c-42").await;

        h.manager.reject_call().await.unwrap();

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("reject-call"), 1);
        assert_eq!(h.devices.acquired(), 0);
        assert_eq!(h.connector.created(), 0);
    }

    #[tokio::test]
    async fn test_accept_without_microphone_returns_to_idle() {
        let mut h = Harness::new();
        h.ring("c-42").await;
        h.devices.deny();

        let result = h.manager.accept_call().await;

        assert_eq!(
            result,
            Err(CallError::Media(MediaError::PermissionDenied))
        );
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.connector.created(), 0);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_second_incoming_call_gets_busy() {
        let mut h = Harness::new();
        h.ring("c-1").await;
        h.manager.accept_call().await.unwrap();

        h.manager
            .handle_server_message(ServerMessage::IncomingCall(IncomingCallPayload {
                call_id: "c-2".to_string(),
                caller_id: "u9".to_string(),
                caller_name: "Dr. Roe".to_string(),
                caller_socket_id: "sock-u9".to_string(),
            }))
            .await;

        assert_eq!(
            h.sink.sent().last(),
            Some(&ClientMessage::RejectCall(CallReplyPayload {
                call_id: "c-2".to_string(),
                caller_socket_id: "sock-u9".to_string(),
                reason: Some(BUSY_REASON.to_string()),
            }))
        );
        assert_eq!(h.manager.state(), CallState::InCall);
        assert_eq!(h.manager.session().unwrap().call_id, "c-1");
    }

    #[tokio::test]
    async fn test_duplicate_incoming_call_is_ignored() {
        let mut h = Harness::new();
        h.ring("c-1").await;
        h.ring("c-1").await;

        assert!(h.sink.sent().is_empty());
        assert_eq!(h.manager.state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_remote_hangup_does_not_echo_end_call() {
        let mut h = Harness::new();
        h.ring("c-1").await;
        h.manager.accept_call().await.unwrap();
        let peer = h.connector.last_peer().unwrap();

        h.manager
            .handle_server_message(ServerMessage::CallEnded(CallIdPayload {
                call_id: "c-1".to_string(),
            }))
            .await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("end-call"), 0);
        assert_eq!(peer.close_count(), 1);
        assert_eq!(h.devices.stops(), 1);
    }

    #[tokio::test]
    async fn test_stale_messages_are_ignored() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();

        h.manager
            .handle_server_message(ServerMessage::CallRejected(CallRejectedPayload {
                call_id: "other".to_string(),
                reason: None,
                callee_id: None,
            }))
            .await;
        h.manager
            .handle_server_message(ServerMessage::CallEnded(CallIdPayload {
                call_id: "other".to_string(),
            }))
            .await;

        assert_eq!(h.manager.state(), CallState::Calling);
        assert_eq!(h.manager.session().unwrap().call_id, call_id);
    }

    #[tokio::test]
    async fn test_transport_loss_ends_call_locally() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        h.accepted(&call_id).await;
        h.drain_events();

        h.manager.handle_transport_lost().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("end-call"), 0);
        assert!(h.drain_events().contains(&CallEvent::Ended {
            call_id,
            reason: EndReason::TransportLost,
        }));
    }

    #[tokio::test]
    async fn test_local_candidates_follow_bound_remote() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.1.1.1 6000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        h.connector
            .last_events()
            .unwrap()
            .emit(PeerEventKind::LocalCandidate(candidate.clone()));
        let event = h.peer_events.recv().await.unwrap();
        assert_eq!(event.call_id, call_id);

        h.manager.handle_peer_event(event).await;
        assert_eq!(h.sink.count("signal"), 0);

        h.accepted(&call_id).await;

        let signals: Vec<_> = h
            .sink
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Signal(s) => Some((s.target_socket_id, s.signal)),
                _ => None,
            })
            .collect();
        assert_eq!(signals.len(), 2);
        assert_eq!(
            signals[0],
            (
                "sock-u2".to_string(),
                SignalData::Candidate { candidate }
            )
        );
    }

    #[tokio::test]
    async fn test_caller_applies_answer_and_candidates() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        h.accepted(&call_id).await;

        h.manager
            .handle_server_message(ServerMessage::Signal(InboundSignal {
                from_socket_id: Some("sock-u2".to_string()),
                signal: SignalData::Answer {
                    sdp: "v=0 answer".to_string(),
                },
            }))
            .await;
        h.manager
            .handle_server_message(ServerMessage::Signal(InboundSignal {
                from_socket_id: Some("sock-u2".to_string()),
                signal: SignalData::Candidate {
                    candidate: IceCandidate {
                        candidate: "candidate:9 1 udp 1 10.2.2.2 7000 typ host".to_string(),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                        username_fragment: None,
                    },
                },
            }))
            .await;

        let peer = h.connector.last_peer().unwrap();
        assert_eq!(peer.remote_answers(), vec!["v=0 answer".to_string()]);
        assert_eq!(peer.candidates().len(), 1);
        assert_eq!(h.manager.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_peer_events_of_old_calls_are_dropped() {
        let mut h = Harness::new();
        h.manager.initiate_call(targets(&["u2"])).await.unwrap();

        h.manager
            .handle_peer_event(PeerEvent {
                call_id: "finished".to_string(),
                kind: PeerEventKind::StateChanged(PeerConnectionState::Failed),
            })
            .await;

        assert_eq!(h.manager.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_peer_failure_ends_call() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        h.accepted(&call_id).await;

        h.manager
            .handle_peer_event(PeerEvent {
                call_id: call_id.clone(),
                kind: PeerEventKind::StateChanged(PeerConnectionState::Failed),
            })
            .await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("end-call"), 1);
        assert!(h.drain_events().contains(&CallEvent::Ended {
            call_id,
            reason: EndReason::PeerFailed,
        }));
    }

    #[tokio::test]
    async fn test_failed_negotiation_ends_call() {
        let mut h = Harness::new();
        let call_id = h.manager.initiate_call(targets(&["u2"])).await.unwrap();
        h.connector.last_peer().unwrap().fail_negotiation();

        h.accepted(&call_id).await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.sink.count("end-call"), 1);
    }

    #[tokio::test]
    async fn test_state_watch_follows_transitions() {
        let mut h = Harness::new();
        let rx = h.manager.watch_state();

        h.ring("c-1").await;
        assert_eq!(*rx.borrow(), CallState::Ringing);

        h.manager.reject_call().await.unwrap();
        assert_eq!(*rx.borrow(), CallState::Idle);
    }
}
