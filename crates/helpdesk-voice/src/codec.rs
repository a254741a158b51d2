//! **AudioFrameCodec** - f32 samples ⇄ 16-bit little-endian PCM ⇄ base64 text.
//!
//! Outbound scaling is asymmetric (negative × 32768, non-negative × 32767) to match
//! the remote agent; inbound samples are divided by 32768. Keep both as-is for wire
//! compatibility.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Quantize one sample in [-1, 1] to signed 16-bit.
fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence.
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Pack samples as 16-bit little-endian PCM bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    bytes
}

/// Reinterpret 16-bit little-endian PCM bytes as f32 samples in approximately [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> VoiceResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Codec(format!(
            "PCM payload has odd length {} (expected 16-bit samples)",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode captured samples for an outbound `audio` message.
pub fn encode_outbound(samples: &[f32]) -> String {
    BASE64.encode(encode_pcm16(samples))
}

/// Decode the `audio` field of an inbound message into samples.
pub fn decode_inbound(text: &str) -> VoiceResult<Vec<f32>> {
    let bytes = BASE64.decode(text.trim())?;
    decode_pcm16(&bytes)
}
