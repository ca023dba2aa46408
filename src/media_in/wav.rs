//! WAV file replayed as a microphone

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::CaptureSource;
use crate::media_event::AudioFrame;

const FRAME_DURATION_MS: u64 = 20;

/// Reads a WAV file and pushes mono frames at the session's input rate.
///
/// With `realtime` set the frames are paced at capture speed, otherwise the
/// whole file is pushed as fast as the channel accepts it.
pub struct WavCaptureSource {
    path: PathBuf,
    sample_rate: u32,
    realtime: bool,
    tx: Option<mpsc::UnboundedSender<AudioFrame>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavCaptureSource {
    pub fn new(
        path: impl Into<PathBuf>,
        sample_rate: u32,
        tx: mpsc::UnboundedSender<AudioFrame>,
    ) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            realtime: true,
            tx: Some(tx),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl CaptureSource for WavCaptureSource {
    fn start(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| anyhow!("WAV source {} already started", self.path.display()))?;

        let samples = load_mono(&self.path, self.sample_rate)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        info!(
            "Replaying {} ({:.1}s at {}Hz)",
            self.path.display(),
            samples.len() as f32 / self.sample_rate as f32,
            self.sample_rate
        );

        let frame_len = (self.sample_rate as u64 * FRAME_DURATION_MS / 1000) as usize;
        let stop = Arc::clone(&self.stop);
        let realtime = self.realtime;

        self.worker = Some(std::thread::spawn(move || {
            for chunk in samples.chunks(frame_len.max(1)) {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(AudioFrame::new(chunk.to_vec())).is_err() {
                    error!("Audio frame channel closed");
                    break;
                }
                if realtime {
                    std::thread::sleep(Duration::from_millis(FRAME_DURATION_MS));
                }
            }
            // dropping tx ends the stream downstream
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for WavCaptureSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Decode a WAV file into normalized mono samples at `target_rate`.
pub fn load_mono(path: &std::path::Path, target_rate: u32) -> Result<Vec<f32>> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(resample_linear(&mono, spec.sample_rate, target_rate))
}

fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &std::path::Path, rate: u32, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_mono_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16000, 2, &[16384, 0, -16384, -16384]);

        let samples = load_mono(&path, 16000).unwrap();
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let out = resample_linear(&input, 32000, 16000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[1], 2.0);
    }

    #[tokio::test]
    async fn test_replay_pushes_all_frames_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, 16000, 1, &vec![8192; 1000]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = WavCaptureSource::new(&path, 16000, tx).realtime(false);
        source.start().unwrap();

        let mut total = 0;
        while let Some(frame) = rx.recv().await {
            assert!(frame.samples.len() <= 320);
            total += frame.samples.len();
        }
        assert_eq!(total, 1000);
        source.stop();
        assert!(source.start().is_err());
    }

    #[test]
    fn test_missing_file_fails_to_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut source = WavCaptureSource::new("/nonexistent/input.wav", 16000, tx);
        assert!(source.start().is_err());
    }
}
