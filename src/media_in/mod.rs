//! Media input: capture sources and the stages that prepare their output

pub mod audio;
pub mod video;
pub mod wav;

pub use audio::{spawn_audio_aggregator, AudioChunkAggregator};
pub use video::{FrameCompressor, FrameDecision, FrameThrottler, ImageCompressor};
pub use wav::WavCaptureSource;

/// A microphone, camera or file that pushes frames into a channel once started.
pub trait CaptureSource: Send {
    fn start(&mut self) -> anyhow::Result<()>;

    /// Stop producing frames. Safe to call more than once.
    fn stop(&mut self);
}
