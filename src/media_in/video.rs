//! Video frame throttling
//!
//! Camera or screen sources deliver frames much faster than the session
//! wants them. The throttler keeps at most one frame per interval and at
//! most one compression in flight; everything else is dropped, never queued.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::error::{ParameterError, ParameterErrorKind};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageError, RgbaImage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::to_base64;
use crate::config::{ImageEncoding, ThrottlerConfig};
use crate::error::Result;
use crate::media_event::{EncodedVideoFrame, MediaEvent, SourceFrame};

/// Compresses a raw frame into an image format the model accepts.
pub trait FrameCompressor: Send + Sync + 'static {
    fn compress(&self, frame: &SourceFrame) -> Result<Vec<u8>>;
    fn mime_type(&self) -> &'static str;
}

/// JPEG/PNG compression with the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct ImageCompressor {
    encoding: ImageEncoding,
}

impl ImageCompressor {
    pub fn new(encoding: ImageEncoding) -> Self {
        Self { encoding }
    }
}

impl FrameCompressor for ImageCompressor {
    fn compress(&self, frame: &SourceFrame) -> Result<Vec<u8>> {
        let image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone()).ok_or_else(
            || ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch)),
        )?;

        let mut buffer = Vec::new();
        match self.encoding {
            ImageEncoding::Jpeg { quality } => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
                let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
                encoder.encode_image(&rgb)?;
            }
            ImageEncoding::Png => {
                let encoder = PngEncoder::new(Cursor::new(&mut buffer));
                encoder.write_image(image.as_raw(), frame.width, frame.height, ExtendedColorType::Rgba8)?;
            }
        }
        Ok(buffer)
    }

    fn mime_type(&self) -> &'static str {
        self.encoding.mime_type()
    }
}

/// What happened to a frame offered to the throttler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Less than the minimum interval since the last accepted frame
    Throttled,
    /// A previous frame is still being compressed
    Busy,
    /// Compression started
    Accepted,
}

/// Rate limiter in front of the frame compressor.
pub struct FrameThrottler<C: FrameCompressor = ImageCompressor> {
    min_interval: Duration,
    last_accepted: Instant,
    in_flight: Arc<AtomicBool>,
    compressor: Arc<C>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    next_frame_id: u64,
}

impl FrameThrottler<ImageCompressor> {
    pub fn new(config: ThrottlerConfig, media_tx: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self::with_compressor(config.min_interval, ImageCompressor::new(config.encoding), media_tx)
    }
}

impl<C: FrameCompressor> FrameThrottler<C> {
    pub fn with_compressor(
        min_interval: Duration,
        compressor: C,
        media_tx: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        Self {
            min_interval,
            last_accepted: Instant::now(),
            in_flight: Arc::new(AtomicBool::new(false)),
            compressor: Arc::new(compressor),
            media_tx,
            next_frame_id: 0,
        }
    }

    /// Use `start` as the first reference point instead of construction time.
    pub fn with_start(mut self, start: Instant) -> Self {
        self.last_accepted = start;
        self
    }

    pub fn on_source_frame(&mut self, frame: SourceFrame) -> FrameDecision {
        self.on_source_frame_at(frame, Instant::now())
    }

    /// Offer a frame observed at `now`. Must be called inside a tokio runtime.
    pub fn on_source_frame_at(&mut self, frame: SourceFrame, now: Instant) -> FrameDecision {
        if now.saturating_duration_since(self.last_accepted) < self.min_interval {
            return FrameDecision::Throttled;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Compression still running, dropping frame");
            return FrameDecision::Busy;
        }

        self.last_accepted = now;
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let compressor = Arc::clone(&self.compressor);
        let in_flight = Arc::clone(&self.in_flight);
        let media_tx = self.media_tx.clone();

        tokio::task::spawn_blocking(move || {
            let result = compressor.compress(&frame);
            in_flight.store(false, Ordering::Release);
            match result {
                Ok(bytes) => {
                    debug!("Frame #{} compressed: {} KB", frame_id, bytes.len() / 1024);
                    let encoded = EncodedVideoFrame {
                        data: to_base64(&bytes),
                        mime_type: compressor.mime_type().to_string(),
                        frame_id,
                    };
                    // It's ok if the session is gone
                    let _ = media_tx.send(MediaEvent::Video(encoded));
                }
                Err(e) => warn!("Frame #{} compression failed: {}", frame_id, e),
            }
        });

        FrameDecision::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::from_base64;
    use crate::error::LiveError;
    use std::sync::Mutex;

    struct InstantCompressor;

    impl FrameCompressor for InstantCompressor {
        fn compress(&self, frame: &SourceFrame) -> Result<Vec<u8>> {
            Ok(frame.rgba.clone())
        }

        fn mime_type(&self) -> &'static str {
            "image/test"
        }
    }

    struct GatedCompressor {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl FrameCompressor for GatedCompressor {
        fn compress(&self, _frame: &SourceFrame) -> Result<Vec<u8>> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(vec![1])
        }

        fn mime_type(&self) -> &'static str {
            "image/test"
        }
    }

    struct FailingCompressor;

    impl FrameCompressor for FailingCompressor {
        fn compress(&self, _frame: &SourceFrame) -> Result<Vec<u8>> {
            Err(LiveError::Config("boom".to_string()))
        }

        fn mime_type(&self) -> &'static str {
            "image/test"
        }
    }

    fn solid_frame(width: u32, height: u32) -> SourceFrame {
        SourceFrame::new(width, height, vec![200; (width * height * 4) as usize])
    }

    #[tokio::test]
    async fn test_emits_floor_of_duration_over_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        let mut throttler =
            FrameThrottler::with_compressor(Duration::from_millis(2000), InstantCompressor, tx)
                .with_start(t0);

        // 100ms arrivals over 10 seconds
        let mut accepted = 0;
        for i in 0..=100u64 {
            let decision =
                throttler.on_source_frame_at(solid_frame(2, 2), t0 + Duration::from_millis(i * 100));
            if decision == FrameDecision::Accepted {
                accepted += 1;
                let MediaEvent::Video(frame) = rx.recv().await.unwrap() else {
                    panic!("Expected a video frame");
                };
                assert_eq!(frame.mime_type, "image/test");
                assert_eq!(from_base64(&frame.data).unwrap().len(), 16);
            }
        }
        assert_eq!(accepted, 10_000 / 2000);
    }

    #[tokio::test]
    async fn test_first_frame_waits_for_interval() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        let mut throttler =
            FrameThrottler::with_compressor(Duration::from_millis(500), InstantCompressor, tx)
                .with_start(t0);
        assert_eq!(throttler.on_source_frame_at(solid_frame(1, 1), t0), FrameDecision::Throttled);
    }

    #[tokio::test]
    async fn test_busy_compressor_drops_frames() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        let compressor = GatedCompressor {
            gate: Mutex::new(gate_rx),
        };
        let mut throttler =
            FrameThrottler::with_compressor(Duration::from_millis(100), compressor, tx).with_start(t0);

        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(throttler.on_source_frame_at(solid_frame(1, 1), t1), FrameDecision::Accepted);
        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(throttler.on_source_frame_at(solid_frame(1, 1), t2), FrameDecision::Busy);

        gate_tx.send(()).unwrap();
        let MediaEvent::Video(frame) = rx.recv().await.unwrap() else {
            panic!("Expected a video frame");
        };
        assert_eq!(frame.frame_id, 0);

        // the busy drop did not move the reference point
        gate_tx.send(()).unwrap();
        assert_eq!(throttler.on_source_frame_at(solid_frame(1, 1), t2), FrameDecision::Accepted);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_compression_failure_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        let mut throttler =
            FrameThrottler::with_compressor(Duration::from_millis(10), FailingCompressor, tx)
                .with_start(t0);
        let decision = throttler.on_source_frame_at(solid_frame(1, 1), t0 + Duration::from_secs(1));
        assert_eq!(decision, FrameDecision::Accepted);
        drop(throttler);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_image_compressor_formats() {
        let frame = solid_frame(8, 8);

        let jpeg = ImageCompressor::new(ImageEncoding::Jpeg { quality: 75 })
            .compress(&frame)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let png = ImageCompressor::new(ImageEncoding::Png).compress(&frame).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 8);
    }

    #[test]
    fn test_image_compressor_rejects_short_buffer() {
        let frame = SourceFrame::new(4, 4, vec![0; 10]);
        let result = ImageCompressor::new(ImageEncoding::Png).compress(&frame);
        assert!(matches!(result, Err(LiveError::Image(_))));
    }
}
