//! Audio chunk aggregation
//!
//! Capture sources deliver small frames at their own tick rate. The
//! aggregator encodes each frame to PCM16 as it arrives and releases one
//! combined base64 chunk per window.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::{encode_pcm16, to_base64};
use crate::config::AggregatorConfig;
use crate::media_event::{AudioFrame, EncodedAudioChunk, MediaEvent};

/// Buffers encoded frames and emits them at a fixed cadence.
///
/// The pending buffer is not capped: after a stall the next emission carries
/// everything that arrived in between.
#[derive(Debug)]
pub struct AudioChunkAggregator {
    window: Duration,
    sample_rate: u32,
    pending: Vec<Vec<u8>>,
    last_emit: Option<Instant>,
}

impl AudioChunkAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            window: config.window,
            sample_rate: config.sample_rate,
            pending: Vec::new(),
            last_emit: None,
        }
    }

    pub fn submit(&mut self, frame: &AudioFrame) -> Option<EncodedAudioChunk> {
        self.submit_at(frame, Instant::now())
    }

    /// Submit a frame observed at `now`.
    pub fn submit_at(&mut self, frame: &AudioFrame, now: Instant) -> Option<EncodedAudioChunk> {
        if frame.is_empty() {
            return None;
        }

        self.pending.push(encode_pcm16(&frame.samples));

        let Some(last) = self.last_emit else {
            // first frame only sets the baseline
            self.last_emit = Some(now);
            return None;
        };

        if now.saturating_duration_since(last) < self.window {
            return None;
        }

        self.last_emit = Some(now);
        self.take_chunk()
    }

    /// Emit whatever is buffered, regardless of the window.
    pub fn flush(&mut self) -> Option<EncodedAudioChunk> {
        self.take_chunk()
    }

    /// Number of encoded bytes waiting for the next emission
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    fn take_chunk(&mut self) -> Option<EncodedAudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = self.pending.concat();
        self.pending.clear();
        Some(EncodedAudioChunk {
            data: to_base64(&bytes),
            sample_rate: self.sample_rate,
        })
    }
}

/// Run an aggregator between a frame receiver and the media channel.
///
/// When the frame channel closes, the remaining audio is flushed and an
/// `AudioStreamEnd` is sent.
pub fn spawn_audio_aggregator(
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    config: AggregatorConfig,
) -> JoinHandle<()> {
    info!(
        "Starting audio aggregation: {}ms window at {}Hz",
        config.window.as_millis(),
        config.sample_rate
    );

    tokio::spawn(async move {
        let mut aggregator = AudioChunkAggregator::new(config);
        let mut chunk_count = 0u64;

        while let Some(frame) = frames.recv().await {
            if let Some(chunk) = aggregator.submit(&frame) {
                chunk_count += 1;
                if chunk_count % 50 == 0 {
                    debug!("Sent {} audio chunks", chunk_count);
                }
                if media_tx.send(MediaEvent::Audio(chunk)).is_err() {
                    debug!("Media channel closed, stopping audio aggregation");
                    return;
                }
            }
        }

        if let Some(chunk) = aggregator.flush() {
            let _ = media_tx.send(MediaEvent::Audio(chunk));
        }
        let _ = media_tx.send(MediaEvent::AudioStreamEnd);
        info!("Audio source finished after {} chunks", chunk_count);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::from_base64;

    fn frame(len: usize) -> AudioFrame {
        AudioFrame::new(vec![0.25; len])
    }

    #[test]
    fn test_first_frame_sets_baseline() {
        let mut agg = AudioChunkAggregator::new(AggregatorConfig::default());
        let t0 = Instant::now();
        assert!(agg.submit_at(&frame(160), t0).is_none());
        assert_eq!(agg.pending_bytes(), 320);
    }

    #[test]
    fn test_emits_once_per_window() {
        let mut agg = AudioChunkAggregator::new(AggregatorConfig::default());
        let t0 = Instant::now();
        let mut emitted = Vec::new();
        let mut submitted_bytes = 0;

        // 20ms frames for one second
        for i in 0..50u64 {
            let f = frame(320);
            submitted_bytes += f.samples.len() * 2;
            if let Some(chunk) = agg.submit_at(&f, t0 + Duration::from_millis(i * 20)) {
                emitted.push((i, chunk));
            }
        }

        // one emission every 5 frames, starting at frame 5
        assert_eq!(emitted.len(), 9);
        for pair in emitted.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 5);
        }

        let emitted_bytes: usize = emitted
            .iter()
            .map(|(_, c)| from_base64(&c.data).unwrap().len())
            .sum();
        assert_eq!(emitted_bytes + agg.pending_bytes(), submitted_bytes);
    }

    #[test]
    fn test_chunk_preserves_arrival_order() {
        let mut agg = AudioChunkAggregator::new(AggregatorConfig::default());
        let t0 = Instant::now();
        agg.submit_at(&AudioFrame::new(vec![0.5]), t0);
        agg.submit_at(&AudioFrame::new(vec![-0.5]), t0 + Duration::from_millis(50));
        let chunk = agg
            .submit_at(&AudioFrame::new(vec![1.0]), t0 + Duration::from_millis(100))
            .unwrap();

        let bytes = from_base64(&chunk.data).unwrap();
        assert_eq!(bytes, encode_pcm16(&[0.5, -0.5, 1.0]));
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(agg.pending_bytes(), 0);
    }

    #[test]
    fn test_empty_frames_are_ignored() {
        let mut agg = AudioChunkAggregator::new(AggregatorConfig::default());
        let t0 = Instant::now();
        assert!(agg.submit_at(&frame(0), t0).is_none());
        // baseline not set by the empty frame
        assert!(agg.submit_at(&frame(10), t0 + Duration::from_secs(1)).is_none());
        assert!(agg.submit_at(&frame(0), t0 + Duration::from_secs(5)).is_none());
        assert_eq!(agg.pending_bytes(), 20);
    }

    #[test]
    fn test_stall_yields_one_large_chunk() {
        let mut agg = AudioChunkAggregator::new(AggregatorConfig::default());
        let t0 = Instant::now();
        agg.submit_at(&frame(100), t0);
        for _ in 0..20 {
            assert!(agg.submit_at(&frame(100), t0).is_none());
        }
        let chunk = agg.submit_at(&frame(100), t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(from_base64(&chunk.data).unwrap().len(), 22 * 200);
    }

    #[tokio::test]
    async fn test_spawned_aggregator_flushes_and_ends_stream() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (media_tx, mut media_rx) = mpsc::unbounded_channel();
        let handle = spawn_audio_aggregator(frame_rx, media_tx, AggregatorConfig::default());

        frame_tx.send(frame(160)).unwrap();
        frame_tx.send(frame(160)).unwrap();
        drop(frame_tx);
        handle.await.unwrap();

        let mut total = 0;
        let mut ended = false;
        while let Some(event) = media_rx.recv().await {
            match event {
                MediaEvent::Audio(chunk) => total += from_base64(&chunk.data).unwrap().len(),
                MediaEvent::AudioStreamEnd => ended = true,
                MediaEvent::Video(_) => panic!("Unexpected video"),
            }
        }
        assert_eq!(total, 640);
        assert!(ended);
    }
}
