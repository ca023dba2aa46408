//! Playback of streamed model audio
//!
//! Model audio arrives as PCM16 fragments. The reconstructor decodes each
//! fragment and appends it to one continuous output buffer so consecutive
//! fragments play back without gaps.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, error, info};

use crate::codec::{decode_pcm16, sample_to_i16};
use crate::config::PlaybackConfig;
use crate::error::Result;

/// An engine-level output that plays one continuous sample buffer.
pub trait AudioOutput: Send {
    /// Append samples to the end of the playback buffer.
    fn append(&mut self, samples: &[f32]);

    fn start(&mut self);

    /// Halt playback and discard anything not yet played.
    fn stop(&mut self);

    fn is_playing(&self) -> bool;
}

/// Continuity counters for one reconstructor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub total_samples: u64,
    pub fragments: u64,
    /// Times playback had to be restarted after running dry
    pub underrun_restarts: u64,
    pub flushes: u64,
}

pub struct PlaybackReconstructor<O: AudioOutput> {
    output: O,
    sample_rate: u32,
    stats: PlaybackStats,
    flushed: bool,
}

impl<O: AudioOutput> PlaybackReconstructor<O> {
    pub fn new(output: O, config: PlaybackConfig) -> Self {
        Self {
            output,
            sample_rate: config.sample_rate,
            stats: PlaybackStats::default(),
            flushed: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_output(self) -> O {
        self.output
    }

    /// Decode a PCM16 fragment and queue it behind everything already queued.
    pub fn enqueue(&mut self, pcm16: &[u8]) {
        let samples = decode_pcm16(pcm16);
        if samples.is_empty() {
            return;
        }

        self.output.append(&samples);

        if !self.output.is_playing() {
            if self.stats.total_samples > 0 && !self.flushed {
                self.stats.underrun_restarts += 1;
                debug!("Playback ran dry, restarting");
            }
            self.output.start();
        }

        self.flushed = false;
        self.stats.total_samples += samples.len() as u64;
        self.stats.fragments += 1;
    }

    /// Drop queued audio and stop playback, e.g. when the model is interrupted.
    pub fn flush_and_stop(&mut self) {
        self.output.stop();
        self.flushed = true;
        self.stats.flushes += 1;
    }
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<f32>,
    playing: bool,
}

/// In-memory output. Clones share the same buffer so a consumer can pull
/// samples while the session pushes them.
#[derive(Debug, Clone, Default)]
pub struct BufferedOutput {
    inner: Arc<Mutex<BufferState>>,
}

impl BufferedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // a panicked consumer leaves plain data behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take up to `max` samples in playback order. Playback stops when the
    /// buffer runs dry.
    pub fn pull(&self, max: usize) -> Vec<f32> {
        let mut state = self.lock();
        if !state.playing {
            return Vec::new();
        }
        let n = max.min(state.queue.len());
        let samples: Vec<f32> = state.queue.drain(..n).collect();
        if state.queue.is_empty() {
            state.playing = false;
        }
        samples
    }

    pub fn buffered(&self) -> usize {
        self.lock().queue.len()
    }
}

impl AudioOutput for BufferedOutput {
    fn append(&mut self, samples: &[f32]) {
        self.lock().queue.extend(samples.iter().copied());
    }

    fn start(&mut self) {
        self.lock().playing = true;
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        state.queue.clear();
        state.playing = false;
    }

    fn is_playing(&self) -> bool {
        self.lock().playing
    }
}

/// Writes played audio to a mono 16-bit WAV file.
pub struct WavFileOutput {
    writer: Option<WavWriter<BufWriter<File>>>,
    playing: bool,
    written: u64,
}

impl WavFileOutput {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        info!("Writing model audio to {}", path.as_ref().display());
        Ok(Self {
            writer: Some(writer),
            playing: false,
            written: 0,
        })
    }

    pub fn samples_written(&self) -> u64 {
        self.written
    }

    /// Flush the WAV header and close the file.
    pub fn finalize(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl AudioOutput for WavFileOutput {
    fn append(&mut self, samples: &[f32]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for &sample in samples {
            if let Err(e) = writer.write_sample(sample_to_i16(sample)) {
                error!("Failed to write audio sample: {}", e);
                return;
            }
            self.written += 1;
        }
    }

    fn start(&mut self) {
        self.playing = true;
    }

    fn stop(&mut self) {
        // samples are written as they arrive, nothing is left to discard
        self.playing = false;
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

impl Drop for WavFileOutput {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_pcm16;

    fn reconstructor() -> (PlaybackReconstructor<BufferedOutput>, BufferedOutput) {
        let output = BufferedOutput::new();
        let consumer = output.clone();
        (PlaybackReconstructor::new(output, PlaybackConfig::default()), consumer)
    }

    #[test]
    fn test_fragments_play_in_order() {
        let (mut playback, consumer) = reconstructor();
        playback.enqueue(&encode_pcm16(&[0.5, 0.25]));
        playback.enqueue(&encode_pcm16(&[-0.5]));

        assert!(consumer.is_playing());
        assert_eq!(consumer.pull(10), vec![0.5, 0.25, -0.5]);
        assert_eq!(playback.stats().total_samples, 3);
        assert_eq!(playback.stats().fragments, 2);
        assert_eq!(playback.sample_rate(), 24000);
    }

    #[test]
    fn test_flush_discards_and_stops() {
        let (mut playback, consumer) = reconstructor();
        playback.enqueue(&encode_pcm16(&[0.1; 480]));
        playback.flush_and_stop();

        assert!(!consumer.is_playing());
        assert_eq!(consumer.buffered(), 0);
        assert!(consumer.pull(10).is_empty());

        // playback resumes on the next fragment, not counted as an underrun
        playback.enqueue(&encode_pcm16(&[0.1; 10]));
        assert!(consumer.is_playing());
        assert_eq!(playback.stats().underrun_restarts, 0);
        assert_eq!(playback.stats().flushes, 1);
    }

    #[test]
    fn test_underrun_restart_counted() {
        let (mut playback, consumer) = reconstructor();
        playback.enqueue(&encode_pcm16(&[0.1; 4]));
        assert_eq!(consumer.pull(100).len(), 4);
        assert!(!consumer.is_playing());

        playback.enqueue(&encode_pcm16(&[0.1; 4]));
        assert_eq!(playback.stats().underrun_restarts, 1);
    }

    #[test]
    fn test_empty_fragment_ignored() {
        let (mut playback, consumer) = reconstructor();
        playback.enqueue(&[0x01]);
        assert!(!consumer.is_playing());
        assert_eq!(playback.stats().fragments, 0);
    }

    #[test]
    fn test_wav_output_writes_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let output = WavFileOutput::create(&path, 24000).unwrap();
        let mut playback = PlaybackReconstructor::new(output, PlaybackConfig::default());
        playback.enqueue(&encode_pcm16(&[0.5; 240]));
        playback.enqueue(&encode_pcm16(&[-0.5; 240]));
        let output = playback.into_output();
        assert_eq!(output.samples_written(), 480);
        output.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24000);
        assert_eq!(reader.len(), 480);
    }
}
