//! OpenAI Realtime wire protocol
//!
//! Every frame is one JSON object discriminated by its `type` field. Client
//! events are a plain internally tagged enum. Server events only model what a
//! session reacts to; anything else is kept as [`ServerEvent::Unknown`].

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::duplex::WireProtocol;
use crate::gemini::FunctionDeclaration;


/// Audio format name for 16-bit little-endian PCM
pub const PCM16: &str = "pcm16";

/// Voice activity detection settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_response: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TurnDetection {
    /// Server-side VAD that answers on its own after 500 ms of silence.
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
            create_response: Some(true),
            extra: Map::new(),
        }
    }
}

/// Function tool in the Realtime flavor (flat, `type: "function"`)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RealtimeTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl From<&FunctionDeclaration> for RealtimeTool {
    fn from(declaration: &FunctionDeclaration) -> Self {
        Self {
            kind: "function".to_string(),
            name: declaration.name.clone(),
            description: declaration.description.clone(),
            parameters: declaration.parameters.clone(),
        }
    }
}

/// Body of `session.update`
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct SessionParameters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    /// `Some(None)` is sent as `null` and turns detection off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Option<TurnDetection>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<RealtimeTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Conversation item: a message, a function call or a function call output
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// JSON-encoded arguments of a function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: Some("user".to_string()),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: Some(text.into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            kind: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn is_function_call(&self) -> bool {
        self.kind == "function_call"
    }
}

/// Overrides for one `response.create`
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ResponseParameters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Events sent by the client
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParameters },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default)]
        response: ResponseParameters,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ErrorDetails {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
}

/// Incremental text, transcript or audio of a response
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Delta {
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
    pub delta: String,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

/// Events sent by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Error(ErrorDetails),
    SessionCreated(Value),
    SessionUpdated(Value),
    /// Server VAD heard the user start talking
    SpeechStarted { item_id: Option<String> },
    InputTranscriptionCompleted { item_id: Option<String>, transcript: String },
    TextDelta(Delta),
    AudioTranscriptDelta(Delta),
    AudioDelta(Delta),
    OutputItemDone { item: ConversationItem },
    ResponseDone(ResponseInfo),
    Unknown { kind: String, payload: Value },
}

impl ServerEvent {
    /// The wire `type` of this event.
    pub fn kind(&self) -> &str {
        match self {
            Self::Error(_) => "error",
            Self::SessionCreated(_) => "session.created",
            Self::SessionUpdated(_) => "session.updated",
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::TextDelta(_) => "response.text.delta",
            Self::AudioTranscriptDelta(_) => "response.audio_transcript.delta",
            Self::AudioDelta(_) => "response.audio.delta",
            Self::OutputItemDone { .. } => "response.output_item.done",
            Self::ResponseDone(_) => "response.done",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetails,
}

#[derive(Deserialize)]
struct SessionEnvelope {
    session: Value,
}

#[derive(Deserialize)]
struct SpeechStarted {
    #[serde(default)]
    item_id: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionCompleted {
    #[serde(default)]
    item_id: Option<String>,
    transcript: String,
}

#[derive(Deserialize)]
struct ItemEnvelope {
    item: ConversationItem,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    response: ResponseInfo,
}

fn payload<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    serde_json::from_value(value)
}

impl ServerEvent {
    fn from_value(value: Value) -> serde_json::Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("event has no type"))?
            .to_string();

        let event = match kind.as_str() {
            "error" => Self::Error(payload::<ErrorEnvelope>(value)?.error),
            "session.created" => Self::SessionCreated(payload::<SessionEnvelope>(value)?.session),
            "session.updated" => Self::SessionUpdated(payload::<SessionEnvelope>(value)?.session),
            "input_audio_buffer.speech_started" => Self::SpeechStarted {
                item_id: payload::<SpeechStarted>(value)?.item_id,
            },
            "conversation.item.input_audio_transcription.completed" => {
                let done: TranscriptionCompleted = payload(value)?;
                Self::InputTranscriptionCompleted {
                    item_id: done.item_id,
                    transcript: done.transcript,
                }
            }
            "response.text.delta" => Self::TextDelta(payload(value)?),
            "response.audio_transcript.delta" => Self::AudioTranscriptDelta(payload(value)?),
            "response.audio.delta" => Self::AudioDelta(payload(value)?),
            "response.output_item.done" => Self::OutputItemDone {
                item: payload::<ItemEnvelope>(value)?.item,
            },
            "response.done" => Self::ResponseDone(payload::<ResponseEnvelope>(value)?.response),
            _ => Self::Unknown {
                kind,
                payload: value,
            },
        };
        Ok(event)
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Parse one server text frame.
pub fn decode_event(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(text)
}

/// OpenAI Realtime framing: exactly one event per frame in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiRealtime;

impl WireProtocol for OpenAiRealtime {
    type Outbound = ClientEvent;
    type Inbound = ServerEvent;

    fn encode(message: &ClientEvent) -> crate::error::Result<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(frame: &str) -> crate::error::Result<Vec<ServerEvent>> {
        Ok(vec![decode_event(frame)?])
    }
}
