//! Native audio through cpal
//!
//! cpal streams are not `Send`, so every stream is built and owned by its own
//! thread and dropped there when the owner lets go. Captured audio is mixed
//! to mono, resampled to 8 kHz and paced onto a PCMU sample track; remote
//! PCMU packets are decoded into a ring that the output callback drains.

use super::media::{LocalAudioTrack, MediaDevices, MediaError};
use super::pcm::{
    decode_frame, downmix, encode_frame, pcmu_capability, resample, SampleRing, FRAME_DURATION,
    PCMU_FRAME_SAMPLES, PCMU_SAMPLE_RATE,
};
use super::peer::RemoteStream;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Preferred device rate
const DEVICE_SAMPLE_RATE: u32 = 48000;

/// Capture ring at 8 kHz (200 ms)
const CAPTURE_RING_SIZE: usize = PCMU_FRAME_SAMPLES * 10;

/// Playback ring at device rate (200 ms at 48 kHz)
const PLAYBACK_RING_SIZE: usize = 9600;

// ============================================================================
// STREAM THREAD
// ============================================================================

/// Keeps a cpal stream alive on a dedicated thread until dropped
struct StreamThread {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `build` on a new thread and parks there while the stream plays.
    /// Resolves once `build` returned, with its value or its error.
    async fn spawn<T, F>(
        name: &str,
        build: F,
        failed: fn(String) -> MediaError,
    ) -> Result<(Self, T), MediaError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(Stream, T), MediaError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, value)) => {
                        let _ = ready_tx.send(Ok(value));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Stop request or owner dropped
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })
            .map_err(|e| failed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(value)) => Ok((
                Self {
                    stop: Some(stop_tx),
                    thread: Some(thread),
                },
                value,
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(failed("audio thread exited".to_string())),
        }
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Audio thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Picks an f32 configuration, 48 kHz if the device supports it
fn select_config(configs: Vec<SupportedStreamConfigRange>) -> Option<StreamConfig> {
    let target = SampleRate(DEVICE_SAMPLE_RATE);
    let usable: Vec<_> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(config) = usable
        .iter()
        .find(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target)
    {
        return Some(config.clone().with_sample_rate(target).into());
    }
    usable
        .into_iter()
        .next()
        .map(|c| c.with_max_sample_rate().into())
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Media devices backed by the default input device
#[derive(Debug, Clone, Default)]
pub struct MicrophoneDevices;

impl MicrophoneDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for MicrophoneDevices {
    async fn acquire_microphone(&self) -> Result<Box<dyn LocalAudioTrack>, MediaError> {
        let ring = Arc::new(SampleRing::with_capacity(CAPTURE_RING_SIZE));
        let capture_ring = Arc::clone(&ring);

        let (stream, device) = StreamThread::spawn(
            "dept-call-mic",
            move || start_capture(capture_ring),
            MediaError::CaptureFailed,
        )
        .await?;

        Ok(Box::new(MicrophoneTrack::start(stream, ring, device)))
    }
}

fn start_capture(ring: Arc<SampleRing>) -> Result<(Stream, String), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;
    let name = device.name().unwrap_or_else(|_| "default input".to_string());

    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::CaptureFailed(e.to_string()))?;
    let config = select_config(configs.collect()).ok_or_else(|| {
        MediaError::CaptureFailed(format!("{} offers no f32 input format", name))
    })?;

    tracing::info!(
        "Starting audio capture on {}: {} Hz, {} channel(s)",
        name,
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels as usize;
    let source_rate = config.sample_rate.0;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                ring.push(&resample(&mono, source_rate, PCMU_SAMPLE_RATE));
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => MediaError::NoInputDevice,
            other => MediaError::CaptureFailed(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaError::CaptureFailed(e.to_string()))?;

    Ok((stream, name))
}

/// Live microphone feeding a PCMU sample track
pub struct MicrophoneTrack {
    id: String,
    device: String,
    track: Arc<TrackLocalStaticSample>,
    stream: Option<StreamThread>,
    pacer: Option<JoinHandle<()>>,
}

impl MicrophoneTrack {
    fn start(stream: StreamThread, ring: Arc<SampleRing>, device: String) -> Self {
        let id = format!("mic-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_string(),
            "dept-call".to_string(),
        ));
        let pacer = tokio::spawn(pace_frames(ring, Arc::clone(&track)));
        tracing::info!("Microphone {} live as {}", device, id);

        Self {
            id,
            device,
            track,
            stream: Some(stream),
            pacer: Some(pacer),
        }
    }
}

/// Writes one encoded frame per 20 ms tick
async fn pace_frames(ring: Arc<SampleRing>, track: Arc<TrackLocalStaticSample>) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    loop {
        ticker.tick().await;
        while let Some(frame) = ring.pop_frame(PCMU_FRAME_SAMPLES) {
            let sample = Sample {
                data: encode_frame(&frame).into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Dropped microphone frame: {}", e);
            }
        }
    }
}

impl LocalAudioTrack for MicrophoneTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.is_live().then(|| Arc::clone(&self.track))
    }

    fn stop(&mut self) {
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            tracing::info!("Microphone {} released ({})", self.device, self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MicrophoneTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MicrophoneTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneTrack")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// SPEAKER
// ============================================================================

/// Plays remote PCMU audio on the default output device
#[derive(Debug, Clone, Default)]
pub struct Speaker;

impl Speaker {
    pub fn new() -> Self {
        Self
    }

    /// Starts playing `stream`; playback stops when the handle is dropped
    pub async fn play(&self, stream: &RemoteStream) -> Result<Playback, MediaError> {
        let track = stream
            .track
            .clone()
            .ok_or_else(|| MediaError::PlaybackFailed("stream has no media track".to_string()))?;
        let codec = track.codec().capability.mime_type;
        if !codec.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
            return Err(MediaError::UnsupportedCodec(codec));
        }

        let ring = Arc::new(SampleRing::with_capacity(PLAYBACK_RING_SIZE));
        let output_ring = Arc::clone(&ring);
        let (output, device_rate) = StreamThread::spawn(
            "dept-call-speaker",
            move || start_playback(output_ring),
            MediaError::PlaybackFailed,
        )
        .await?;

        let reader = tokio::spawn(read_remote(track, ring, device_rate));
        tracing::info!("Playing remote audio {}", stream.track_id);

        Ok(Playback {
            track_id: stream.track_id.clone(),
            _output: output,
            reader,
        })
    }
}

fn start_playback(ring: Arc<SampleRing>) -> Result<(Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(MediaError::NoOutputDevice)?;

    let configs = device
        .supported_output_configs()
        .map_err(|e| MediaError::PlaybackFailed(e.to_string()))?;
    let config = select_config(configs.collect())
        .ok_or_else(|| MediaError::PlaybackFailed("no f32 output format".to_string()))?;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channel(s)",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| ring.fill(data, channels),
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => MediaError::NoOutputDevice,
            other => MediaError::PlaybackFailed(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaError::PlaybackFailed(e.to_string()))?;

    Ok((stream, rate))
}

async fn read_remote(track: Arc<TrackRemote>, ring: Arc<SampleRing>, device_rate: u32) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                let pcm = decode_frame(&packet.payload);
                let dropped = ring.push(&resample(&pcm, PCMU_SAMPLE_RATE, device_rate));
                if dropped > 0 {
                    tracing::trace!("Playback ring full, dropped {} sample(s)", dropped);
                }
            }
            Err(e) => {
                tracing::debug!("Remote audio ended: {}", e);
                break;
            }
        }
    }
}

/// Running playback of one remote track
pub struct Playback {
    track_id: String,
    _output: StreamThread,
    reader: JoinHandle<()>,
}

impl Playback {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.reader.abort();
        tracing::debug!("Playback of {} stopped", self.track_id);
    }
}

impl std::fmt::Debug for Playback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playback")
            .field("track_id", &self.track_id)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
