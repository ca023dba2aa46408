//! rsglive - streaming client for a remote service gateway
//!
//! Two independent flows:
//! - a live multimodal session: microphone/camera frames are encoded and
//!   streamed over one WebSocket, model audio and text are reassembled, and
//!   tool calls are answered ([`session_runner::LiveSession`]). The Gemini
//!   Live dialect is driven by [`SessionController`], the OpenAI Realtime
//!   one by [`RealtimeController`];
//! - Snap3D text-to-3D jobs, submitted over HTTP and polled through their
//!   generation stages ([`snap3d::AsyncTaskPoller`]).

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod duplex;
pub mod error;
pub mod gemini;
pub mod media_event;
pub mod media_in;
pub mod openai_realtime;
pub mod playback;
pub mod realtime_session;
pub mod session;
pub mod session_runner;
pub mod snap3d;

pub use config::{GatewayConfig, RealtimeConfig, SessionConfig};
pub use error::{LiveError, Result, TaskError};
pub use realtime_session::RealtimeController;
pub use session::{SessionController, SessionEvent, SessionState};
pub use session_runner::{LiveSession, SessionDriver};
