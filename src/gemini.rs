//! Gemini Live wire protocol
//!
//! Client and server messages exchanged as JSON text frames over the live
//! channel. Every message carries exactly one top-level tag. Server frames
//! may bundle several tags, so a frame parses into a list of messages and
//! unknown tags or fields are kept verbatim so they can be re-serialized.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::duplex::WireProtocol;


/// Base64 payload with its MIME type.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
            extra: Map::new(),
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub response: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<Value>,
}

/// Declaration of a tool the model may call.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(default)]
    pub function_declarations: Vec<FunctionDeclaration>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowCompression {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window: Option<SlidingWindow>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<ContextWindowCompression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<Value>,
}

/// A chunk of realtime input (audio/video/text)
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

impl RealtimeInput {
    pub fn audio(blob: Blob) -> Self {
        Self {
            audio: Some(blob),
            ..Default::default()
        }
    }

    pub fn video(blob: Blob) -> Self {
        Self {
            video: Some(blob),
            ..Default::default()
        }
    }
}

/// Complete turns sent as conversation content.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Incremental model output.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerContent {
    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete.unwrap_or(false)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_left: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error payload reported by the server or the gateway in front of it.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetupComplete(Value),
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation(ToolCallCancellation),
    GoAway(GoAway),
    UsageMetadata(UsageMetadata),
    Error(ServerError),
    /// Any tag this client does not know, kept verbatim
    Unknown { tag: String, payload: Value },
}

impl ServerMessage {
    pub fn tag(&self) -> &str {
        match self {
            Self::SetupComplete(_) => "setupComplete",
            Self::ServerContent(_) => "serverContent",
            Self::ToolCall(_) => "toolCall",
            Self::ToolCallCancellation(_) => "toolCallCancellation",
            Self::GoAway(_) => "goAway",
            Self::UsageMetadata(_) => "usageMetadata",
            Self::Error(_) => "error",
            Self::Unknown { tag, .. } => tag,
        }
    }

    /// Build a message from one tag and its payload.
    pub fn from_tagged(tag: &str, payload: Value) -> serde_json::Result<Self> {
        Ok(match tag {
            "setupComplete" => Self::SetupComplete(payload),
            "serverContent" => Self::ServerContent(serde_json::from_value(payload)?),
            "toolCall" => Self::ToolCall(serde_json::from_value(payload)?),
            "toolCallCancellation" => Self::ToolCallCancellation(serde_json::from_value(payload)?),
            "goAway" => Self::GoAway(serde_json::from_value(payload)?),
            "usageMetadata" => Self::UsageMetadata(serde_json::from_value(payload)?),
            "error" => Self::Error(serde_json::from_value(payload)?),
            other => Self::Unknown {
                tag: other.to_string(),
                payload,
            },
        })
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::SetupComplete(v) => Ok(v.clone()),
            Self::ServerContent(c) => serde_json::to_value(c),
            Self::ToolCall(c) => serde_json::to_value(c),
            Self::ToolCallCancellation(c) => serde_json::to_value(c),
            Self::GoAway(g) => serde_json::to_value(g),
            Self::UsageMetadata(u) => serde_json::to_value(u),
            Self::Error(e) => serde_json::to_value(e),
            Self::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.payload().map_err(serde::ser::Error::custom)?;
        let mut map = Map::new();
        map.insert(self.tag().to_string(), payload);
        Value::Object(map).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "expected exactly one message tag, found {}",
                map.len()
            )));
        }
        let (tag, payload) = map.into_iter().next().ok_or_else(|| D::Error::custom("empty message"))?;
        ServerMessage::from_tagged(&tag, payload).map_err(D::Error::custom)
    }
}

// Order in which bundled tags are handed to the session.
const TAG_PRIORITY: [&str; 7] = [
    "setupComplete",
    "error",
    "serverContent",
    "toolCall",
    "toolCallCancellation",
    "goAway",
    "usageMetadata",
];

fn tag_rank(tag: &str) -> usize {
    TAG_PRIORITY
        .iter()
        .position(|t| *t == tag)
        .unwrap_or(TAG_PRIORITY.len())
}

/// Parse one server text frame into its messages.
///
/// Known tags come out in a fixed order (setup, error, content, tool calls,
/// go-away, usage); unknown tags follow, sorted by name.
pub fn parse_frame(text: &str) -> serde_json::Result<Vec<ServerMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(serde_json::Error::custom("server frame is not a JSON object"));
    };
    let mut entries: Vec<(String, Value)> = map.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| tag_rank(a).cmp(&tag_rank(b)).then_with(|| a.cmp(b)));
    entries
        .into_iter()
        .map(|(tag, payload)| ServerMessage::from_tagged(&tag, payload))
        .collect()
}

/// Gemini Live framing: one tag per client frame, possibly several per server frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiLive;

impl WireProtocol for GeminiLive {
    type Outbound = ClientMessage;
    type Inbound = ServerMessage;

    fn encode(message: &ClientMessage) -> crate::error::Result<String> {
        Ok(message.to_json()?)
    }

    fn decode(frame: &str) -> crate::error::Result<Vec<ServerMessage>> {
        Ok(parse_frame(frame)?)
    }
}

/// Rebuild a single frame from parsed messages.
pub fn merge_frame(messages: &[ServerMessage]) -> serde_json::Result<Value> {
    let mut map = Map::new();
    for message in messages {
        map.insert(message.tag().to_string(), message.payload()?);
    }
    Ok(Value::Object(map))
}
