//! Session controller for the OpenAI Realtime dialect
//!
//! Same states and [`SessionEvent`]s as [`SessionController`](crate::session::SessionController),
//! driven by Realtime events instead. `session.update` is the setup message
//! and `session.updated` its acknowledgement. Tool results are correlated by
//! `call_id` and the model is asked to continue once its current response is
//! done.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::from_base64;
use crate::config::{GatewayConfig, RealtimeConfig};
use crate::duplex::ChannelEvent;
use crate::error::{LiveError, Result, UNKNOWN_ERROR_CODE};
use crate::gemini::{FunctionCall, UsageMetadata};
use crate::media_event::MediaEvent;
use crate::openai_realtime::{
    ClientEvent, ConversationItem, ErrorDetails, OpenAiRealtime, ResponseInfo, ServerEvent,
};
use crate::playback::{AudioOutput, PlaybackReconstructor};
use crate::session::{SessionEvent, SessionState, ToolHandler};
use crate::session_runner::SessionDriver;

pub struct RealtimeController<O: AudioOutput> {
    config: RealtimeConfig,
    state: SessionState,
    playback: PlaybackReconstructor<O>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    transcript: Option<String>,
    /// A response is producing output
    responding: bool,
    /// Tool outputs were sent during the current response
    continue_after_response: bool,
    outbound: Vec<ClientEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<O: AudioOutput> RealtimeController<O> {
    pub fn new(
        config: RealtimeConfig,
        playback: PlaybackReconstructor<O>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            state: SessionState::Idle,
            playback,
            tools: HashMap::new(),
            transcript: None,
            responding: false,
            continue_after_response: false,
            outbound: Vec::new(),
            events,
        };
        (controller, events_rx)
    }

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

    pub fn drain_outbound(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.outbound)
    }

    pub fn on_channel_event(&mut self, event: ChannelEvent<ServerEvent>) {
        if self.state.is_terminal() {
            debug!("Session finished, ignoring {:?}", event);
            return;
        }

        match event {
            ChannelEvent::Open => self.on_open(),
            ChannelEvent::Message(event) => self.on_server_event(event),
            ChannelEvent::Error(message) => {
                error!("Session error: {}", message);
                self.state = SessionState::Errored;
                self.emit(SessionEvent::Error {
                    code: UNKNOWN_ERROR_CODE,
                    message,
                });
            }
            ChannelEvent::Close(reason) => {
                info!("Session closed: {:?}", reason);
                self.state = SessionState::Closed;
                self.emit(SessionEvent::Closed { reason });
            }
        }
    }

    /// Forward microphone audio. Video has no place in this dialect.
    pub fn on_media(&mut self, media: MediaEvent) {
        if self.state != SessionState::Streaming {
            debug!("Session not streaming, dropping media");
            return;
        }

        match media {
            MediaEvent::Audio(chunk) => {
                self.outbound
                    .push(ClientEvent::InputAudioBufferAppend { audio: chunk.data });
            }
            MediaEvent::Video(_) => debug!("Realtime sessions take no video, dropping frame"),
            MediaEvent::AudioStreamEnd => {
                // with server VAD the server commits and answers on its own
                if !self.config.server_vad {
                    self.outbound.push(ClientEvent::InputAudioBufferCommit);
                    self.request_response();
                }
            }
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(LiveError::NotReady("text can only be sent while streaming"));
        }
        self.outbound.push(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        });
        self.request_response();
        Ok(())
    }

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
        info!("Channel open, configuring realtime session for {}", self.config.model);
        self.outbound.push(ClientEvent::SessionUpdate {
            session: self.config.to_session(),
        });
        self.state = SessionState::AwaitingSetupAck;
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated(_) => debug!("Realtime session created"),
            ServerEvent::SessionUpdated(_) => {
                if self.state == SessionState::AwaitingSetupAck {
                    info!("✅ Session configured, streaming");
                    self.state = SessionState::Streaming;
                    self.emit(SessionEvent::SetupComplete);
                }
            }
            ServerEvent::Error(details) => self.on_error(details),
            ServerEvent::Unknown { kind, .. } => debug!("Ignoring server event '{}'", kind),
            other if self.state != SessionState::Streaming => {
                debug!("Not streaming yet, ignoring '{}'", other.kind());
            }
            ServerEvent::TextDelta(delta) | ServerEvent::AudioTranscriptDelta(delta) => {
                self.responding = true;
                self.append_transcript(&delta.delta);
            }
            ServerEvent::AudioDelta(delta) => {
                self.responding = true;
                match from_base64(&delta.delta) {
                    Ok(pcm) => self.playback.enqueue(&pcm),
                    Err(e) => warn!("Skipping undecodable audio delta: {}", e),
                }
            }
            ServerEvent::SpeechStarted { .. } => {
                if self.responding {
                    info!("User barged in, flushing playback");
                    self.playback.flush_and_stop();
                    self.emit(SessionEvent::Interrupted);
                }
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.emit(SessionEvent::InputTranscript(transcript));
            }
            ServerEvent::OutputItemDone { item } => {
                if item.is_function_call() {
                    self.on_function_call(item);
                }
            }
            ServerEvent::ResponseDone(response) => self.on_response_done(response),
        }
    }

    fn on_error(&mut self, details: ErrorDetails) {
        // the session stays usable after a rejected event
        let message = match details.code {
            Some(code) => format!("{}: {}", code, details.message),
            None => details.message,
        };
        warn!("Realtime error: {}", message);
        self.emit(SessionEvent::Error {
            code: UNKNOWN_ERROR_CODE,
            message,
        });
    }

    fn on_function_call(&mut self, item: ConversationItem) {
        let args = match item.arguments.as_deref().map(serde_json::from_str::<Value>) {
            Some(Ok(args)) => args,
            Some(Err(e)) => {
                warn!("Tool arguments are not JSON: {}", e);
                Value::Null
            }
            None => Value::Null,
        };
        let call = FunctionCall {
            name: item.name.unwrap_or_default(),
            id: item.call_id,
            args,
            ..Default::default()
        };

        let Some(handler) = self.tools.get(&call.name).cloned() else {
            debug!("No handler for tool '{}'", call.name);
            self.emit(SessionEvent::ToolCall(call));
            return;
        };
        let Some(call_id) = call.id.clone() else {
            warn!("Tool call '{}' has no call_id, cannot answer", call.name);
            return;
        };

        info!("🔧 Calling tool '{}'", call.name);
        if let Some(result) = handler.call(&call) {
            let output = match result {
                Value::String(text) => text,
                other => other.to_string(),
            };
            self.outbound.push(ClientEvent::ConversationItemCreate {
                item: ConversationItem::function_output(call_id, output),
            });
            self.continue_after_response = true;
        }
    }

    fn on_response_done(&mut self, response: ResponseInfo) {
        self.responding = false;
        if let Some(text) = self.transcript.take() {
            self.emit(SessionEvent::TranscriptComplete(text));
        }
        if let Some(usage) = response.usage.as_ref().map(usage_metadata) {
            self.emit(SessionEvent::Usage(usage));
        }
        self.emit(SessionEvent::TurnComplete);

        if std::mem::take(&mut self.continue_after_response) {
            self.request_response();
        }
    }

    fn request_response(&mut self) {
        self.outbound.push(ClientEvent::ResponseCreate {
            response: Default::default(),
        });
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

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn usage_metadata(usage: &Value) -> UsageMetadata {
    let count = |key: &str| usage.get(key).and_then(Value::as_u64);
    UsageMetadata {
        prompt_token_count: count("input_tokens"),
        response_token_count: count("output_tokens"),
        total_token_count: count("total_tokens"),
        ..Default::default()
    }
}

impl<O: AudioOutput + 'static> SessionDriver for RealtimeController<O> {
    type Protocol = OpenAiRealtime;

    fn request_url(&self, gateway: &GatewayConfig) -> Result<url::Url> {
        gateway.realtime_request_url(&self.config.model)
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn on_channel_event(&mut self, event: ChannelEvent<ServerEvent>) {
        RealtimeController::on_channel_event(self, event)
    }

    fn on_media(&mut self, media: MediaEvent) {
        RealtimeController::on_media(self, media)
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        RealtimeController::send_text(self, text)
    }

    fn end_audio_stream(&mut self) -> Result<()> {
        RealtimeController::end_audio_stream(self)
    }

    fn drain_outbound(&mut self) -> Vec<ClientEvent> {
        RealtimeController::drain_outbound(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_pcm16, to_base64};
    use crate::config::PlaybackConfig;
    use crate::media_event::{EncodedAudioChunk, EncodedVideoFrame};
    use crate::openai_realtime::decode_event;
    use crate::playback::BufferedOutput;
    use serde_json::json;

    type Controller = RealtimeController<BufferedOutput>;

    fn controller_with(config: RealtimeConfig) -> (Controller, mpsc::UnboundedReceiver<SessionEvent>, BufferedOutput) {
        let output = BufferedOutput::new();
        let consumer = output.clone();
        let playback = PlaybackReconstructor::new(output, PlaybackConfig::default());
        let (controller, events) = RealtimeController::new(config, playback);
        (controller, events, consumer)
    }

    fn server(controller: &mut Controller, event: Value) {
        let event = decode_event(&event.to_string()).unwrap();
        controller.on_channel_event(ChannelEvent::Message(event));
    }

    fn streaming_with(config: RealtimeConfig) -> (Controller, mpsc::UnboundedReceiver<SessionEvent>, BufferedOutput) {
        let (mut c, mut events, output) = controller_with(config);
        c.on_channel_event(ChannelEvent::Open);
        server(&mut c, json!({"type": "session.created", "session": {}}));
        server(&mut c, json!({"type": "session.updated", "session": {}}));
        c.drain_outbound();
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SetupComplete);
        (c, events, output)
    }

    fn streaming() -> (Controller, mpsc::UnboundedReceiver<SessionEvent>, BufferedOutput) {
        streaming_with(RealtimeConfig::default())
    }

    fn drain_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn outbound_json(c: &mut Controller) -> Vec<Value> {
        c.drain_outbound()
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect()
    }

    #[test]
    fn test_open_sends_session_update() {
        let (mut c, mut events, _) = controller_with(RealtimeConfig::default());
        c.on_channel_event(ChannelEvent::Open);
        assert_eq!(c.state(), SessionState::AwaitingSetupAck);

        let out = outbound_json(&mut c);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "session.update");
        assert_eq!(out[0]["session"]["input_audio_format"], "pcm16");

        // session.created alone is not the acknowledgement
        server(&mut c, json!({"type": "session.created", "session": {}}));
        assert_eq!(c.state(), SessionState::AwaitingSetupAck);
        assert!(events.try_recv().is_err());
        assert!(c.send_text("hi").is_err());
    }

    #[test]
    fn test_audio_forwarded_and_video_dropped() {
        let (mut c, _events, _) = streaming();
        c.on_media(MediaEvent::Audio(EncodedAudioChunk {
            data: "AAAA".to_string(),
            sample_rate: 24000,
        }));
        c.on_media(MediaEvent::Video(EncodedVideoFrame {
            data: "BBBB".to_string(),
            mime_type: "image/jpeg".to_string(),
            frame_id: 0,
        }));
        c.end_audio_stream().unwrap();

        // server VAD: ending the stream sends nothing
        let out = outbound_json(&mut c);
        assert_eq!(out, vec![json!({"type": "input_audio_buffer.append", "audio": "AAAA"})]);
    }

    #[test]
    fn test_manual_turns_commit_and_request_response() {
        let (mut c, _events, _) = streaming_with(RealtimeConfig {
            server_vad: false,
            ..Default::default()
        });
        c.end_audio_stream().unwrap();

        let out = outbound_json(&mut c);
        assert_eq!(out[0]["type"], "input_audio_buffer.commit");
        assert_eq!(out[1]["type"], "response.create");
    }

    #[test]
    fn test_text_turn_creates_item_and_response() {
        let (mut c, _events, _) = streaming();
        c.send_text("tell me a pun").unwrap();

        let out = outbound_json(&mut c);
        assert_eq!(out[0]["type"], "conversation.item.create");
        assert_eq!(out[0]["item"]["role"], "user");
        assert_eq!(out[0]["item"]["content"][0]["text"], "tell me a pun");
        assert_eq!(out[1]["type"], "response.create");
    }

    #[test]
    fn test_response_deltas_reassembled() {
        let (mut c, mut events, output) = streaming();
        let audio = to_base64(&encode_pcm16(&[0.25; 240]));
        server(&mut c, json!({"type": "response.audio.delta", "delta": audio}));
        server(&mut c, json!({"type": "response.audio.delta", "delta": "@@not base64@@"}));
        server(&mut c, json!({"type": "response.audio_transcript.delta", "delta": "pun "}));
        server(&mut c, json!({"type": "response.audio_transcript.delta", "delta": "intended"}));
        server(&mut c, json!({
            "type": "response.done",
            "response": {"id": "r1", "status": "completed", "usage": {"total_tokens": 30, "input_tokens": 10, "output_tokens": 20}}
        }));

        assert_eq!(output.buffered(), 240);
        let events = drain_events(&mut events);
        assert_eq!(
            events,
            vec![
                SessionEvent::TranscriptDelta("pun ".to_string()),
                SessionEvent::TranscriptDelta("intended".to_string()),
                SessionEvent::TranscriptComplete("pun intended".to_string()),
                SessionEvent::Usage(UsageMetadata {
                    prompt_token_count: Some(10),
                    response_token_count: Some(20),
                    total_token_count: Some(30),
                    ..Default::default()
                }),
                SessionEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_speech_during_response_interrupts_playback() {
        let (mut c, mut events, output) = streaming();
        // no response yet, so speech is just the user's turn
        server(&mut c, json!({"type": "input_audio_buffer.speech_started", "item_id": "i0"}));
        assert!(drain_events(&mut events).is_empty());

        let audio = to_base64(&encode_pcm16(&[0.5; 480]));
        server(&mut c, json!({"type": "response.audio.delta", "delta": audio}));
        assert_eq!(output.buffered(), 480);
        server(&mut c, json!({"type": "input_audio_buffer.speech_started", "item_id": "i1"}));

        assert_eq!(output.buffered(), 0);
        assert_eq!(drain_events(&mut events), vec![SessionEvent::Interrupted]);
        server(&mut c, json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "i1",
            "transcript": "wait"
        }));
        assert_eq!(drain_events(&mut events), vec![SessionEvent::InputTranscript("wait".to_string())]);
    }

    #[test]
    fn test_tool_output_correlated_by_call_id() {
        let (mut c, mut events, _) = streaming();
        c.register_tool("set-text-color", |call: &FunctionCall| {
            assert_eq!(call.args["r"], 255);
            Some(json!({"ok": true}))
        });

        server(&mut c, json!({
            "type": "response.output_item.done",
            "item": {
                "type": "function_call",
                "name": "set-text-color",
                "call_id": "call_7",
                "arguments": "{\"r\":255,\"g\":0,\"b\":0}"
            }
        }));
        let out = outbound_json(&mut c);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["item"]["type"], "function_call_output");
        assert_eq!(out[0]["item"]["call_id"], "call_7");
        assert_eq!(out[0]["item"]["output"], r#"{"ok":true}"#);

        // the model continues only after its current response is done
        server(&mut c, json!({"type": "response.done", "response": {}}));
        let out = outbound_json(&mut c);
        assert_eq!(out, vec![json!({"type": "response.create", "response": {}})]);
        assert_eq!(drain_events(&mut events), vec![SessionEvent::TurnComplete]);

        server(&mut c, json!({"type": "response.done", "response": {}}));
        assert!(c.drain_outbound().is_empty());
    }

    #[test]
    fn test_unhandled_tool_call_reported() {
        let (mut c, mut events, _) = streaming();
        server(&mut c, json!({
            "type": "response.output_item.done",
            "item": {"type": "function_call", "name": "lookup", "call_id": "call_1", "arguments": "{}"}
        }));

        assert!(c.drain_outbound().is_empty());
        match events.try_recv().unwrap() {
            SessionEvent::ToolCall(call) => {
                assert_eq!(call.name, "lookup");
                assert_eq!(call.id.as_deref(), Some("call_1"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_server_error_keeps_session_open() {
        let (mut c, mut events, _) = streaming();
        server(&mut c, json!({
            "type": "error",
            "error": {"type": "invalid_request_error", "code": "bad_event", "message": "nope"}
        }));

        assert_eq!(c.state(), SessionState::Streaming);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error {
                code: UNKNOWN_ERROR_CODE,
                message: "bad_event: nope".to_string()
            }
        );
        assert!(c.send_text("still here").is_ok());
    }

    #[test]
    fn test_channel_failure_is_terminal() {
        let (mut c, mut events, _) = streaming();
        c.on_channel_event(ChannelEvent::Error("reset".to_string()));
        assert_eq!(c.state(), SessionState::Errored);

        c.on_channel_event(ChannelEvent::Close(None));
        server(&mut c, json!({"type": "response.text.delta", "delta": "late"}));
        assert_eq!(c.state(), SessionState::Errored);
        assert_eq!(drain_events(&mut events).len(), 1);
    }

    #[test]
    fn test_request_url_targets_realtime_endpoint() {
        let (c, _events, _) = controller_with(RealtimeConfig::default());
        let gateway = GatewayConfig::with_token("tok");
        let url = SessionDriver::request_url(&c, &gateway).unwrap();
        assert!(url.as_str().contains("model=gpt-4o-mini-realtime-preview"));
    }
}
