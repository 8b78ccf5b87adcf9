//! PCM conversion for the native audio path
//!
//! Calls carry G.711 μ-law (PCMU): 8 kHz mono, 20 ms frames of 160 one-byte
//! samples. Sound cards run at whatever rate they like, so captured audio is
//! mixed down to mono and resampled before encoding, and decoded audio goes
//! the other way before playback.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

// ============================================================================
// CONSTANTS
// ============================================================================

/// PCMU clock rate
pub const PCMU_SAMPLE_RATE: u32 = 8000;

/// Packetization interval
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per 20 ms frame at 8 kHz
pub const PCMU_FRAME_SAMPLES: usize = 160;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Codec capability of a local PCMU track
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_string(),
        clock_rate: PCMU_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

// ============================================================================
// G.711 μ-LAW
// ============================================================================

/// Compresses one 16-bit sample to μ-law
pub fn encode_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    let pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    (!(sign | (exponent << 4) | mantissa)) as u8
}

/// Expands one μ-law byte to a 16-bit sample
pub fn decode_mulaw(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;

    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes float samples in `[-1.0, 1.0]` as a PCMU payload
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| encode_mulaw((s.clamp(-1.0, 1.0) * 32767.0) as i16))
        .collect()
}

/// Decodes a PCMU payload to float samples
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| decode_mulaw(*b) as f32 / 32768.0)
        .collect()
}

// ============================================================================
// FORMAT CONVERSION
// ============================================================================

/// Averages interleaved channels into mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear resampling between two rates
pub fn resample(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 {
        return data.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// SAMPLE RING
// ============================================================================

/// Bounded sample queue shared between a device callback and a task
pub struct SampleRing {
    buffer: Mutex<HeapRb<f32>>,
}

impl SampleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(HeapRb::new(capacity)),
        }
    }

    /// Queues samples; returns how many were dropped because the ring is full
    pub fn push(&self, samples: &[f32]) -> usize {
        let mut buffer = self.buffer.lock();
        samples
            .iter()
            .filter(|s| buffer.try_push(**s).is_err())
            .count()
    }

    /// Takes exactly `len` samples, or nothing if fewer are queued
    pub fn pop_frame(&self, len: usize) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < len {
            return None;
        }
        Some((0..len).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Fills an interleaved output buffer, one queued sample per frame
    /// copied to every channel; silence once the ring runs dry
    pub fn fill(&self, out: &mut [f32], channels: usize) {
        let mut buffer = self.buffer.lock();
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = buffer.try_pop().unwrap_or(0.0);
            frame.fill(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("queued", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
