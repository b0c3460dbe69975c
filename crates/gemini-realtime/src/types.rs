//! Wire types for the Gemini Live `BidiGenerateContent` WebSocket protocol.

use avatar_core::generic_types::{
    ContentPart, FunctionCall, FunctionResponse, ServerContent, ServerEvent,
};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

// --- Client -> Gemini ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(BidiGenerateContentRealtimeInput),
    ClientContent(BidiGenerateContentClientContent),
    ToolResponse(BidiGenerateContentToolResponse),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<RealtimeInputConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<Value>,
}

/// Serializes as `{}`; its presence switches transcription on.
#[derive(Serialize, Debug, Default)]
pub struct AudioTranscriptionConfig {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
    pub start_of_speech_sensitivity: String,
    pub end_of_speech_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Serialize, Debug)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentRealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

// --- Gemini -> Client ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<LiveServerContent>,
    pub tool_call: Option<LiveToolCall>,
    pub usage_metadata: Option<UsageMetadata>,
    pub go_away: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerContent {
    pub model_turn: Option<ServerContentTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
    pub output_transcription: Option<ServerTranscription>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerContentTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug)]
pub struct ServerTranscription {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveToolCall {
    #[serde(default)]
    pub function_calls: Vec<WireFunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct WireFunctionCall {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub total_token_count: Option<u64>,
}

impl ServerMessage {
    /// Splits one wire message into relay events.
    ///
    /// Tool calls are emitted ahead of server content so the client can switch
    /// presentation state before the related audio arrives.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }
        if let Some(tool_call) = self.tool_call {
            let calls: Vec<FunctionCall> = tool_call
                .function_calls
                .into_iter()
                .map(|call| FunctionCall {
                    id: call.id,
                    name: call.name,
                    args: call.args.unwrap_or_else(|| Value::Object(Default::default())),
                })
                .collect();
            if !calls.is_empty() {
                events.push(ServerEvent::ToolCall { calls });
            }
        }
        if let Some(content) = self.server_content {
            events.push(ServerEvent::ServerContent(content.into_content()));
        }
        if let Some(usage) = self.usage_metadata {
            events.push(ServerEvent::UsageMetadata {
                total_tokens: usage.total_token_count.unwrap_or(0),
            });
        }
        if self.go_away.is_some() {
            events.push(ServerEvent::GoAway);
        }
        events
    }
}

impl LiveServerContent {
    fn into_content(self) -> ServerContent {
        let parts = self
            .model_turn
            .map(|turn| turn.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| {
                if let Some(blob) = part.inline_data {
                    match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                        Ok(raw) => Some(ContentPart::Audio(Bytes::from(raw))),
                        Err(e) => {
                            warn!(error = %e, mime_type = ?blob.mime_type, "Dropping undecodable inline data");
                            None
                        }
                    }
                } else {
                    part.text.map(ContentPart::Text)
                }
            })
            .collect();

        ServerContent {
            parts,
            interrupted: self.interrupted.unwrap_or(false),
            turn_complete: self.turn_complete.unwrap_or(false),
            output_transcription: self.output_transcription.map(|t| t.text),
        }
    }
}
