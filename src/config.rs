//! Configuration for the gateway connection, live sessions and Snap3D polling.
//!
//! Credentials are always passed in explicitly; nothing here reads a global.

use std::time::Duration;

use crate::error::{LiveError, Result};
use crate::gemini::{
    Content, ContextWindowCompression, FunctionDeclaration, GenerationConfig, Part, Setup,
    SlidingWindow, Tool,
};
use crate::openai_realtime::{RealtimeTool, SessionParameters, TurnDetection, PCM16};

/// Default live endpoint of the remote service gateway.
pub const DEFAULT_LIVE_URL: &str = "wss://api.snapchat.com/rsg/gemini/live_api";
/// Default OpenAI Realtime endpoint of the remote service gateway.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.snapchat.com/rsg/openai/real_time";
/// Default Snap3D endpoint of the remote service gateway.
pub const DEFAULT_SNAP3D_URL: &str = "https://api.snapchat.com/rsg/snap3d";
/// Query parameter the gateway reads the token from.
pub const DEFAULT_TOKEN_PARAM: &str = "api-token";

/// Connection details shared by the live channel and the task transport.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub live_url: String,
    pub realtime_url: String,
    pub snap3d_url: String,
    pub api_token: String,
    pub token_param: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            live_url: DEFAULT_LIVE_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            snap3d_url: DEFAULT_SNAP3D_URL.to_string(),
            api_token: String::new(),
            token_param: DEFAULT_TOKEN_PARAM.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn with_token(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            ..Default::default()
        }
    }

    /// Build a config from `RSG_API_TOKEN` plus optional `RSG_LIVE_URL`,
    /// `RSG_REALTIME_URL` and `RSG_SNAP3D_URL` overrides.
    pub fn from_env() -> Result<Self> {
        let api_token = std::env::var("RSG_API_TOKEN")
            .map_err(|_| LiveError::Config("RSG_API_TOKEN is not set".to_string()))?;
        let mut config = Self::with_token(api_token);
        if let Ok(url) = std::env::var("RSG_LIVE_URL") {
            config.live_url = url;
        }
        if let Ok(url) = std::env::var("RSG_REALTIME_URL") {
            config.realtime_url = url;
        }
        if let Ok(url) = std::env::var("RSG_SNAP3D_URL") {
            config.snap3d_url = url;
        }
        Ok(config)
    }

    /// Live endpoint with the token attached as a handshake parameter.
    pub fn live_request_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.live_url)?;
        url.query_pairs_mut()
            .append_pair(&self.token_param, &self.api_token);
        Ok(url)
    }

    /// Realtime endpoint; the model and API version ride along with the token.
    pub fn realtime_request_url(&self, model: &str) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.realtime_url)?;
        url.query_pairs_mut()
            .append_pair(&self.token_param, &self.api_token)
            .append_pair("OpenAI-Beta", "realtime=v1")
            .append_pair("model", model);
        Ok(url)
    }
}

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Context window compression policy sent with the setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub trigger_tokens: u32,
    pub target_tokens: u32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            trigger_tokens: 20000,
            target_tokens: 16000,
        }
    }
}

/// Configuration for one live session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub temperature: Option<f32>,
    /// Prebuilt voice name, only used for audio responses
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub tools: Vec<FunctionDeclaration>,
    pub compression: Option<CompressionPolicy>,
    pub output_transcription: bool,
    pub input_transcription: bool,
    /// Sample rate of the microphone audio we send
    pub input_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-live-preview-04-09".to_string(),
            response_modality: ResponseModality::Audio,
            temperature: Some(1.0),
            voice: Some("Puck".to_string()),
            system_instruction: None,
            tools: Vec::new(),
            compression: Some(CompressionPolicy::default()),
            output_transcription: true,
            input_transcription: false,
            input_sample_rate: 16000,
        }
    }
}

impl SessionConfig {
    /// Build the setup message for this session.
    pub fn to_setup(&self) -> Setup {
        let speech_config = match (self.response_modality, &self.voice) {
            (ResponseModality::Audio, Some(voice)) => Some(serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })),
            _ => None,
        };

        let generation_config = GenerationConfig {
            response_modalities: vec![self.response_modality.as_str().to_string()],
            temperature: self.temperature,
            speech_config,
            ..Default::default()
        };

        let tools = if self.tools.is_empty() {
            None
        } else {
            Some(vec![Tool {
                function_declarations: self.tools.clone(),
                ..Default::default()
            }])
        };

        Setup {
            model: self.model.clone(),
            generation_config: Some(generation_config),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
                ..Default::default()
            }),
            tools,
            context_window_compression: self.compression.map(|c| ContextWindowCompression {
                trigger_tokens: Some(c.trigger_tokens),
                sliding_window: Some(SlidingWindow {
                    target_tokens: Some(c.target_tokens),
                }),
            }),
            output_audio_transcription: self.output_transcription.then(|| serde_json::json!({})),
            input_audio_transcription: self.input_transcription.then(|| serde_json::json!({})),
            ..Default::default()
        }
    }
}

/// Configuration for one OpenAI Realtime session
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub model: String,
    /// Text is always on; audio is added for `Audio`
    pub response_modality: ResponseModality,
    pub instructions: Option<String>,
    pub voice: String,
    pub temperature: Option<f32>,
    pub tools: Vec<FunctionDeclaration>,
    /// Let the server detect turns and answer on its own
    pub server_vad: bool,
    /// Transcription model for microphone audio, if wanted
    pub input_transcription_model: Option<String>,
    /// Realtime PCM16 is fixed at 24 kHz
    pub input_sample_rate: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini-realtime-preview".to_string(),
            response_modality: ResponseModality::Audio,
            instructions: None,
            voice: "coral".to_string(),
            temperature: None,
            tools: Vec::new(),
            server_vad: true,
            input_transcription_model: None,
            input_sample_rate: 24000,
        }
    }
}

impl RealtimeConfig {
    /// Build the `session.update` body for this session.
    pub fn to_session(&self) -> SessionParameters {
        let mut modalities = vec!["text".to_string()];
        if self.response_modality == ResponseModality::Audio {
            modalities.push("audio".to_string());
        }

        SessionParameters {
            modalities,
            instructions: self.instructions.clone(),
            voice: Some(self.voice.clone()),
            input_audio_format: Some(PCM16.to_string()),
            output_audio_format: Some(PCM16.to_string()),
            input_audio_transcription: self
                .input_transcription_model
                .as_ref()
                .map(|model| serde_json::json!({ "model": model })),
            turn_detection: Some(self.server_vad.then(TurnDetection::server_vad)),
            tools: self.tools.iter().map(RealtimeTool::from).collect(),
            temperature: self.temperature,
            ..Default::default()
        }
    }
}

/// Audio aggregation settings
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub window: Duration,
    pub sample_rate: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            sample_rate: 16000,
        }
    }
}

/// Image encoding used for outgoing video frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Jpeg { quality: u8 },
    Png,
}

impl ImageEncoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg { .. } => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

/// Video throttling settings
#[derive(Debug, Clone, Copy)]
pub struct ThrottlerConfig {
    pub min_interval: Duration,
    pub encoding: ImageEncoding,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(2000),
            encoding: ImageEncoding::Jpeg { quality: 75 },
        }
    }
}

/// Playback settings for model audio
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    /// Rate of the PCM16 audio the model streams back
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { sample_rate: 24000 }
    }
}

/// Snap3D polling settings
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Value of the `use_case` field added to every submit body
    pub use_case: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            use_case: "Spectacles".to_string(),
        }
    }
}
