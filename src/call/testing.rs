//! Test doubles for the call module

use super::media::{LocalAudioTrack, MediaDevices, MediaError};
use super::peer::{NativePeer, PeerConnector, PeerError, PeerEventSender};
use crate::signaling::{ClientMessage, IceCandidate, SignalingError, SignalingSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Records every message instead of sending it
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<ClientMessage>>,
    offline: AtomicBool,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|m| m.kind() == kind).count()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Native peer that answers with canned SDP and counts closes
#[derive(Default)]
pub struct MockPeer {
    closes: AtomicUsize,
    remote_offers: Mutex<Vec<String>>,
    remote_answers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    fail_negotiation: AtomicBool,
}

impl MockPeer {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn remote_offers(&self) -> Vec<String> {
        self.remote_offers.lock().clone()
    }

    pub fn remote_answers(&self) -> Vec<String> {
        self.remote_answers.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PeerError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            Err(PeerError::WebRTC("negotiation failed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NativePeer for MockPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        self.check()?;
        Ok("v=0 mock-offer".to_string())
    }

    async fn create_answer(&self, offer_sdp: String) -> Result<String, PeerError> {
        self.check()?;
        self.remote_offers.lock().push(offer_sdp);
        Ok("v=0 mock-answer".to_string())
    }

    async fn set_remote_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        self.check()?;
        self.remote_answers.lock().push(answer_sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MockPeer`]s and keeps them for inspection
#[derive(Default)]
pub struct MockConnector {
    peers: Mutex<Vec<(Arc<MockPeer>, PeerEventSender)>>,
    fail: AtomicBool,
}

impl MockConnector {
    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().map(|(p, _)| Arc::clone(p))
    }

    pub fn last_events(&self) -> Option<PeerEventSender> {
        self.peers.lock().last().map(|(_, e)| e.clone())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _local: Option<&dyn LocalAudioTrack>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn NativePeer>, PeerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PeerError::WebRTC("no route".to_string()));
        }
        let peer = Arc::new(MockPeer::default());
        self.peers.lock().push((Arc::clone(&peer), events));
        Ok(peer)
    }
}

/// Microphone double counting acquisitions and stops
#[derive(Default)]
pub struct MockDevices {
    acquired: AtomicUsize,
    stops: Arc<AtomicUsize>,
    denied: AtomicBool,
}

impl MockDevices {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudioTrack>, MediaError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTrack {
            id: format!("mock-mic-{}", n),
            live: true,
            stops: Arc::clone(&self.stops),
        }))
    }
}

struct MockTrack {
    id: String,
    live: bool,
    stops: Arc<AtomicUsize>,
}

impl LocalAudioTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        None
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}
