//! Call handling: session state machine, peer connection adapter and media
//!
//! - `session`: one call at a time, from initiate/incoming to teardown
//! - `peer`: negotiation traffic addressed to the remote transport id
//! - `webrtc`: the production [`PeerConnector`]
//! - `media`: microphone acquisition behind [`MediaDevices`]
//! - `pcm`: G.711 μ-law and sample conversion
//! - `audio`: cpal microphone and speaker (feature `native-audio`)

#[cfg(feature = "native-audio")]
mod audio;
mod media;
mod pcm;
mod peer;
mod session;
mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "native-audio")]
pub use audio::{MicrophoneDevices, MicrophoneTrack, Playback, Speaker};
pub use media::{
    LocalAudioTrack, MediaDevices, MediaError, SampleTrack, SampleTrackDevices, CHANNELS,
    SAMPLE_RATE,
};
pub use pcm::{
    decode_frame, decode_mulaw, downmix, encode_frame, encode_mulaw, pcmu_capability, resample,
    SampleRing, FRAME_DURATION, PCMU_FRAME_SAMPLES, PCMU_SAMPLE_RATE,
};
pub use peer::{
    NativePeer, PeerConnectionAdapter, PeerConnectionState, PeerConnector, PeerError, PeerEvent,
    PeerEventKind, PeerEventSender, RemoteStream,
};
pub use session::{
    CallError, CallEvent, CallSession, CallSessionManager, CallState, EndReason, BUSY_REASON,
};
pub use webrtc::{WebRtcConnector, WebRtcPeer};
