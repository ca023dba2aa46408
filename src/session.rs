//! Streaming session controller
//!
//! A synchronous state machine for one live session. Channel events and
//! encoded media go in; client messages come out through an outbound queue
//! that the runner drains after every event, and everything the caller cares
//! about is reported as a [`SessionEvent`].
//!
//! ```text
//! Idle --Open--> AwaitingSetupAck --SetupComplete--> Streaming
//!   any --Error--> Errored        any --Close--> Closed
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::from_base64;
use crate::config::{GatewayConfig, SessionConfig};
use crate::error::{LiveError, Result, UNKNOWN_ERROR_CODE};
use crate::gemini::{
    Blob, ClientContent, ClientMessage, Content, FunctionCall, FunctionResponse, Part,
    GeminiLive, RealtimeInput, ServerContent, ServerMessage, ToolCall, ToolResponse,
    UsageMetadata,
};
use crate::duplex::ChannelEvent;
use crate::media_event::MediaEvent;
use crate::playback::{AudioOutput, PlaybackReconstructor};
use crate::session_runner::SessionDriver;

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingSetupAck,
    Streaming,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Notifications for whoever owns the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SetupComplete,
    /// Incremental model text for the open turn
    TranscriptDelta(String),
    /// Full text of a turn, once per turn
    TranscriptComplete(String),
    /// What the server heard from the microphone
    InputTranscript(String),
    TurnComplete,
    Interrupted,
    /// A function call no handler is registered for
    ToolCall(FunctionCall),
    ToolCallCancellation(Vec<String>),
    GoAway { time_left: Option<String> },
    Usage(UsageMetadata),
    Error { code: i64, message: String },
    Closed { reason: Option<String> },
}

/// Answers function calls by name.
///
/// Returning `None` sends nothing back for that call.
pub trait ToolHandler: Send + Sync {
    fn call(&self, call: &FunctionCall) -> Option<Value>;
}

impl<F> ToolHandler for F
where
    F: Fn(&FunctionCall) -> Option<Value> + Send + Sync,
{
    fn call(&self, call: &FunctionCall) -> Option<Value> {
        self(call)
    }
}

pub struct SessionController<O: AudioOutput> {
    config: SessionConfig,
    state: SessionState,
    playback: PlaybackReconstructor<O>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    /// Text of the open turn; `None` when no turn is open
    transcript: Option<String>,
    outbound: Vec<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<O: AudioOutput> SessionController<O> {
    pub fn new(
        config: SessionConfig,
        playback: PlaybackReconstructor<O>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            state: SessionState::Idle,
            playback,
            tools: HashMap::new(),
            transcript: None,
            outbound: Vec::new(),
            events,
        };
        (controller, events_rx)
    }

    /// Route function calls named `name` to `handler`.
    pub fn register_tool(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        self.tools.insert(name.into(), Arc::new(handler));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn playback(&self) -> &PlaybackReconstructor<O> {
        &self.playback
    }

    pub fn into_playback(self) -> PlaybackReconstructor<O> {
        self.playback
    }

    /// Take every message queued since the last drain, in order.
    pub fn drain_outbound(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbound)
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent<ServerMessage>) {
        if self.state.is_terminal() {
            debug!("Session finished, ignoring {:?}", event);
            return;
        }

        match event {
            ChannelEvent::Open => self.on_open(),
            ChannelEvent::Message(message) => self.on_server_message(message),
            ChannelEvent::Error(message) => self.fail(UNKNOWN_ERROR_CODE, message),
            ChannelEvent::Close(reason) => {
                info!("Session closed: {:?}", reason);
                self.state = SessionState::Closed;
                self.emit(SessionEvent::Closed { reason });
            }
        }
    }

    /// Forward encoded media. Dropped unless the session is streaming.
    pub fn on_media(&mut self, media: MediaEvent) {
        if self.state != SessionState::Streaming {
            debug!("Session not streaming, dropping media");
            return;
        }

        let input = match media {
            MediaEvent::Audio(chunk) => RealtimeInput::audio(Blob::new(chunk.mime_type(), chunk.data)),
            MediaEvent::Video(frame) => RealtimeInput::video(Blob::new(frame.mime_type, frame.data)),
            MediaEvent::AudioStreamEnd => RealtimeInput {
                audio_stream_end: Some(true),
                ..Default::default()
            },
        };
        self.outbound.push(ClientMessage::RealtimeInput(input));
    }

    /// Send a complete user turn as text.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(LiveError::NotReady("text can only be sent while streaming"));
        }
        self.outbound.push(ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(text)],
                ..Default::default()
            }],
            turn_complete: Some(true),
        }));
        Ok(())
    }

    /// Tell the server the microphone stream paused or ended.
    pub fn end_audio_stream(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(LiveError::NotReady("no audio stream to end"));
        }
        self.on_media(MediaEvent::AudioStreamEnd);
        Ok(())
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Idle {
            warn!("Unexpected open in state {:?}", self.state);
            return;
        }
        info!("Channel open, sending setup for {}", self.config.model);
        self.outbound.push(ClientMessage::Setup(self.config.to_setup()));
        self.state = SessionState::AwaitingSetupAck;
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SetupComplete(_) => {
                if self.state == SessionState::AwaitingSetupAck {
                    info!("✅ Setup complete, streaming");
                    self.state = SessionState::Streaming;
                    self.emit(SessionEvent::SetupComplete);
                } else {
                    warn!("Ignoring setupComplete in state {:?}", self.state);
                }
            }
            ServerMessage::Error(err) => {
                let code = err.code.unwrap_or(UNKNOWN_ERROR_CODE);
                let message = err
                    .message
                    .or(err.status)
                    .unwrap_or_else(|| "unknown server error".to_string());
                self.fail(code, message);
            }
            ServerMessage::GoAway(go_away) => {
                warn!("Server going away in {:?}", go_away.time_left);
                self.emit(SessionEvent::GoAway {
                    time_left: go_away.time_left,
                });
            }
            ServerMessage::UsageMetadata(usage) => self.emit(SessionEvent::Usage(usage)),
            ServerMessage::Unknown { tag, .. } => debug!("Ignoring server message '{}'", tag),
            other if self.state != SessionState::Streaming => {
                debug!("Not streaming yet, ignoring '{}'", other.tag());
            }
            ServerMessage::ServerContent(content) => self.on_server_content(content),
            ServerMessage::ToolCall(call) => self.on_tool_call(call),
            ServerMessage::ToolCallCancellation(cancel) => {
                self.emit(SessionEvent::ToolCallCancellation(cancel.ids));
            }
        }
    }

    fn on_server_content(&mut self, content: ServerContent) {
        if content.is_interrupted() {
            info!("Model interrupted, flushing playback");
            self.playback.flush_and_stop();
            self.emit(SessionEvent::Interrupted);
        }

        if let Some(turn) = &content.model_turn {
            for part in &turn.parts {
                if let Some(blob) = &part.inline_data {
                    if blob.mime_type.starts_with("audio/pcm") {
                        match from_base64(&blob.data) {
                            Ok(pcm) => self.playback.enqueue(&pcm),
                            Err(e) => warn!("Skipping undecodable audio part: {}", e),
                        }
                    }
                }
                if let Some(text) = &part.text {
                    self.append_transcript(text);
                }
            }
        }

        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            self.append_transcript(&text);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            self.emit(SessionEvent::InputTranscript(text));
        }

        if content.turn_complete.unwrap_or(false) {
            if let Some(text) = self.transcript.take() {
                self.emit(SessionEvent::TranscriptComplete(text));
            }
            self.emit(SessionEvent::TurnComplete);
        }
    }

    fn append_transcript(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.transcript
            .get_or_insert_with(String::new)
            .push_str(delta);
        self.emit(SessionEvent::TranscriptDelta(delta.to_string()));
    }

    fn on_tool_call(&mut self, call: ToolCall) {
        let mut responses = Vec::new();
        for function_call in call.function_calls {
            let Some(handler) = self.tools.get(&function_call.name).cloned() else {
                debug!("No handler for tool '{}'", function_call.name);
                self.emit(SessionEvent::ToolCall(function_call));
                continue;
            };
            info!("🔧 Calling tool '{}'", function_call.name);
            if let Some(result) = handler.call(&function_call) {
                // answered by name only, the call id is not echoed back
                responses.push(FunctionResponse {
                    name: function_call.name,
                    id: None,
                    response: json!({ "content": result }),
                    ..Default::default()
                });
            }
        }

        if !responses.is_empty() {
            self.outbound.push(ClientMessage::ToolResponse(ToolResponse {
                function_responses: responses,
            }));
        }
    }

    fn fail(&mut self, code: i64, message: String) {
        error!("Session error {}: {}", code, message);
        self.state = SessionState::Errored;
        self.emit(SessionEvent::Error { code, message });
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

impl<O: AudioOutput + 'static> SessionDriver for SessionController<O> {
    type Protocol = GeminiLive;

    fn request_url(&self, gateway: &GatewayConfig) -> Result<url::Url> {
        gateway.live_request_url()
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn on_channel_event(&mut self, event: ChannelEvent<ServerMessage>) {
        SessionController::on_channel_event(self, event)
    }

    fn on_media(&mut self, media: MediaEvent) {
        SessionController::on_media(self, media)
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        SessionController::send_text(self, text)
    }

    fn end_audio_stream(&mut self) -> Result<()> {
        SessionController::end_audio_stream(self)
    }

    fn drain_outbound(&mut self) -> Vec<ClientMessage> {
        SessionController::drain_outbound(self)
    }
}
