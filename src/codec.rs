//! PCM16 sample codec
//!
//! Converts between normalized float samples and signed 16-bit little-endian
//! PCM, and between PCM bytes and the base64 text carried inside JSON frames.

use base64::engine::general_purpose;
use base64::Engine;

use crate::error::Result;

/// Encode normalized samples as PCM16 little-endian bytes.
///
/// Samples are clamped to [-1, 1]. Positive values scale by 32767 and negative
/// values by 32768, so -1.0 maps to `i16::MIN` and 1.0 to `i16::MAX`.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Decode PCM16 little-endian bytes into normalized samples.
///
/// Only whole 2-byte groups are read; a trailing odd byte is dropped.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

pub(crate) fn sample_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Render bytes as standard padded base64.
pub fn to_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Parse standard padded base64.
pub fn from_base64(text: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(text)?)
}
