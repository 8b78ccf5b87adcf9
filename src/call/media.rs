//! Local media acquisition
//!
//! The session manager asks a [`MediaDevices`] implementation for a
//! microphone track before it touches the network. Whatever comes back is
//! owned by the session and stopped exactly when the call is torn down.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Sample rate (48kHz, the Opus default)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Microphone access denied")]
    PermissionDenied,

    #[error("Failed to start audio capture: {0}")]
    CaptureFailed(String),

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Failed to start audio playback: {0}")]
    PlaybackFailed(String),

    #[error("Cannot play {0} audio")]
    UnsupportedCodec(String),
}

/// A live local audio track
pub trait LocalAudioTrack: Send + Sync {
    /// Track id, for logging
    fn id(&self) -> &str;

    /// RTP track to attach to the peer connection, if the implementation
    /// produces one
    fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>>;

    /// Releases the underlying device; must be safe to call twice
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudioTrack>, MediaError>;
}

// ============================================================================
// SAMPLE TRACK DEVICES
// ============================================================================

/// Media devices backed by an Opus sample track the host application feeds
///
/// Headless deployments (nurse-station kiosks, the terminal client) write
/// encoded frames into [`SampleTrack::rtc_track`] themselves.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    available: bool,
}

impl SampleTrackDevices {
    pub fn new() -> Self {
        Self { available: true }
    }

    /// Devices that always fail, as when the workstation has no microphone
    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudioTrack>, MediaError> {
        if !self.available {
            return Err(MediaError::NoInputDevice);
        }
        Ok(Box::new(SampleTrack::new()))
    }
}

pub struct SampleTrack {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    live: bool,
}

impl SampleTrack {
    pub fn new() -> Self {
        let id = format!("mic-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            "dept-call".to_string(),
        ));
        tracing::debug!("Local audio track {} created", id);

        Self {
            id,
            track,
            live: true,
        }
    }
}

impl Default for SampleTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAudioTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.live.then(|| Arc::clone(&self.track))
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            tracing::info!("Local audio track {} stopped", self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl std::fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("live", &self.live)
            .finish()
    }
}
