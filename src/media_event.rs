//! Media types flowing from capture sources to the session controller

use std::time::Instant;

/// One capture tick of normalized mono samples in [-1, 1]
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Aggregated PCM16 audio, base64 rendered and ready for the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedAudioChunk {
    pub data: String,
    pub sample_rate: u32,
}

impl EncodedAudioChunk {
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Compressed still image, base64 rendered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedVideoFrame {
    pub data: String,
    pub mime_type: String,
    pub frame_id: u64,
}

/// Raw RGBA8 frame from a camera or screen source
#[derive(Clone, Debug)]
pub struct SourceFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub timestamp: Instant,
}

impl SourceFrame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba,
            timestamp: Instant::now(),
        }
    }
}

/// Encoded media handed to the session controller
#[derive(Clone, Debug, PartialEq)]
pub enum MediaEvent {
    Audio(EncodedAudioChunk),
    Video(EncodedVideoFrame),
    /// The audio source ran dry (end of file, device closed)
    AudioStreamEnd,
}
