//! A [`LiveSession`] backed by the Gemini Live WebSocket API.

use crate::types::{
    AudioTranscriptionConfig, AutomaticActivityDetection, BidiGenerateContentClientContent,
    BidiGenerateContentRealtimeInput, BidiGenerateContentSetup, BidiGenerateContentToolResponse,
    Blob, ClientMessage, Content, GenerationConfig, Part, PrebuiltVoiceConfig,
    RealtimeInputConfig, ResponseModality, ServerMessage, SpeechConfig, Tool, VoiceConfig,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use avatar_core::{
    RelayError,
    generic_types::{FunctionResponse, LiveInput, ServerEvent},
    realtime_api::{EventStream, LiveConnector, LiveSession},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{self, SplitSink, SplitStream},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

type GeminiStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Prebuilt voices accepted by the Live API.
pub const SUPPORTED_VOICES: &[&str] = &[
    "Puck",
    "Charon",
    "Kore",
    "Fenrir",
    "Aoede",
    "Zubenelgenubi",
    "Orion",
    "Pegasus",
    "Vega",
    "Algenib",
    "Alkaid",
    "Altair",
    "Castor",
    "Polaris",
];

pub fn is_supported_voice(voice: &str) -> bool {
    SUPPORTED_VOICES.contains(&voice)
}

/// Voice activity detection tuning sent with the setup message.
#[derive(Clone, Debug)]
pub struct VadSettings {
    pub start_of_speech_sensitivity: String,
    pub end_of_speech_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            start_of_speech_sensitivity: "START_SENSITIVITY_HIGH".to_string(),
            end_of_speech_sensitivity: "END_SENSITIVITY_HIGH".to_string(),
            prefix_padding_ms: 100,
            silence_duration_ms: 200,
        }
    }
}

/// Everything needed to open a Gemini Live session.
#[derive(Clone, Debug)]
pub struct GeminiLiveConfig {
    pub api_key: String,
    pub api_version: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    /// Raw function declarations, passed through as-is.
    pub tools: Vec<Value>,
    pub output_transcription: bool,
    /// `None` disables automatic activity detection.
    pub vad: Option<VadSettings>,
}

impl GeminiLiveConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_version: "v1beta".to_string(),
            model: model.into(),
            voice: voice.into(),
            system_instruction: None,
            tools: Vec::new(),
            output_transcription: true,
            vad: Some(VadSettings::default()),
        }
    }

    fn url(&self) -> String {
        format!(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.{}.GenerativeService.BidiGenerateContent?key={}",
            self.api_version, self.api_key
        )
    }

    /// Builds the first message of every session.
    pub fn setup_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        ClientMessage::Setup(BidiGenerateContentSetup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: "user".to_string(),
                parts: vec![Part { text: text.clone() }],
            }),
            tools: if self.tools.is_empty() {
                Vec::new()
            } else {
                vec![Tool {
                    function_declarations: self.tools.clone(),
                }]
            },
            output_audio_transcription: self
                .output_transcription
                .then(AudioTranscriptionConfig::default),
            realtime_input_config: self.vad.as_ref().map(|vad| RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection {
                    disabled: false,
                    start_of_speech_sensitivity: vad.start_of_speech_sensitivity.clone(),
                    end_of_speech_sensitivity: vad.end_of_speech_sensitivity.clone(),
                    prefix_padding_ms: vad.prefix_padding_ms,
                    silence_duration_ms: vad.silence_duration_ms,
                },
            }),
        })
    }
}

type QueuedEvent = Result<ServerEvent, RelayError>;

/// Hands out per-turn streams over the events produced by the reader task.
#[derive(Clone)]
pub(crate) struct EventQueue {
    rx: Arc<Mutex<mpsc::Receiver<QueuedEvent>>>,
}

impl EventQueue {
    pub(crate) fn new(rx: mpsc::Receiver<QueuedEvent>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Yields events up to and including the next turn-complete, or a single
    /// error once the reader has stopped.
    pub(crate) fn turn_stream(&self) -> EventStream {
        let rx = self.rx.clone();
        Box::pin(stream::unfold((rx, false), |(rx, finished)| async move {
            if finished {
                return None;
            }
            let next = rx.lock().await.recv().await;
            match next {
                Some(Ok(event)) => {
                    let turn_done = event.is_turn_complete();
                    Some((Ok(event), (rx, turn_done)))
                }
                Some(Err(e)) => Some((Err(e), (rx, true))),
                None => Some((Err(RelayError::TransportClosed), (rx, true))),
            }
        }))
    }
}

fn map_ws_error(err: tungstenite::Error) -> RelayError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RelayError::TransportClosed
        }
        other => RelayError::from_upstream_message(other.to_string()),
    }
}

/// Maps a close frame from Gemini onto the relay's error taxonomy.
pub(crate) fn classify_close(reason: &str) -> RelayError {
    if reason.trim().is_empty() {
        return RelayError::TransportClosed;
    }
    match RelayError::from_upstream_message(reason) {
        RelayError::Unclassified(_) => {
            RelayError::from_upstream_message(format!("Gemini closed the session: {reason}"))
        }
        classified => classified,
    }
}

/// Decodes upstream frames and queues the resulting events until the socket
/// closes or the session is dropped.
async fn read_loop(mut gemini_rx: SplitStream<GeminiStream>, tx: mpsc::Sender<QueuedEvent>) {
    while let Some(msg_result) = gemini_rx.next().await {
        let payload = match msg_result {
            Ok(WsMessage::Text(text)) => serde_json::from_str::<ServerMessage>(text.as_str()),
            Ok(WsMessage::Binary(data)) => serde_json::from_slice::<ServerMessage>(&data),
            Ok(WsMessage::Close(close_frame)) => {
                let reason = close_frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                info!(?close_frame, "Gemini WebSocket connection closed by server.");
                let _ = tx.send(Err(classify_close(&reason))).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Error reading from Gemini WebSocket: {}", e);
                let _ = tx.send(Err(map_ws_error(e))).await;
                return;
            }
        };

        match payload {
            Ok(message) => {
                for event in message.into_events() {
                    if tx.send(Ok(event)).await.is_err() {
                        debug!("Event receiver dropped; stopping Gemini reader.");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to parse Gemini server message"),
        }
    }
}

/// One open Gemini Live session.
pub struct GeminiLiveSession {
    sink: Mutex<SplitSink<GeminiStream, WsMessage>>,
    events: EventQueue,
    reader: JoinHandle<()>,
}

impl GeminiLiveSession {
    /// Connects and sends the setup message. The `setupComplete`
    /// acknowledgement arrives as the first event on [`LiveSession::receive`].
    pub async fn connect(config: &GeminiLiveConfig) -> Result<Self> {
        let (ws_stream, _) = connect_async(config.url())
            .await
            .context("Failed to connect to Gemini Live WebSocket")?;
        info!(model = %config.model, voice = %config.voice, "Connected to Gemini Live WebSocket.");
        let (mut gemini_tx, gemini_rx) = ws_stream.split();

        let setup = serde_json::to_string(&config.setup_message())?;
        gemini_tx
            .send(WsMessage::Text(setup.into()))
            .await
            .context("Failed to send Gemini setup message")?;

        let (tx, rx) = mpsc::channel(128);
        let reader = tokio::spawn(read_loop(gemini_rx, tx));

        Ok(Self {
            sink: Mutex::new(gemini_tx),
            events: EventQueue::new(rx),
            reader,
        })
    }

    async fn write(&self, message: &ClientMessage) -> Result<(), RelayError> {
        let payload = serde_json::to_string(message).map_err(anyhow::Error::from)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(map_ws_error)
    }
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send(&self, input: LiveInput, end_of_turn: bool) -> Result<(), RelayError> {
        let message = match input {
            // Media goes through realtime input; server-side activity detection
            // decides where the turn ends.
            LiveInput::Audio { data, mime_type } | LiveInput::Image { data, mime_type } => {
                ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
                    media_chunks: vec![Blob { mime_type, data }],
                })
            }
            LiveInput::Text(text) => ClientMessage::ClientContent(BidiGenerateContentClientContent {
                turns: vec![Content {
                    role: "user".to_string(),
                    parts: vec![Part { text }],
                }],
                turn_complete: end_of_turn,
            }),
        };
        self.write(&message).await
    }

    async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<(), RelayError> {
        let message = ClientMessage::ToolResponse(BidiGenerateContentToolResponse {
            function_responses: responses,
        });
        self.write(&message).await
    }

    fn receive(&self) -> EventStream {
        self.events.turn_stream()
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.reader.abort();
        match self.sink.lock().await.close().await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                RelayError::TransportClosed => Ok(()),
                other => Err(other),
            },
        }
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Opens a fresh [`GeminiLiveSession`] per client connection.
pub struct GeminiConnector {
    config: Arc<GeminiLiveConfig>,
}

impl GeminiConnector {
    pub fn new(config: GeminiLiveConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(&self) -> Result<Arc<dyn LiveSession>, RelayError> {
        match GeminiLiveSession::connect(&self.config).await {
            Ok(session) => Ok(Arc::new(session)),
            Err(e) => Err(RelayError::from_upstream_message(format!("{e:#}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_core::generic_types::ServerContent;
    use serde_json::json;

    fn content(turn_complete: bool) -> ServerEvent {
        ServerEvent::ServerContent(ServerContent {
            turn_complete,
            ..Default::default()
        })
    }

    #[test]
    fn test_voice_validation() {
        assert!(is_supported_voice("Puck"));
        assert!(is_supported_voice("Polaris"));
        assert!(!is_supported_voice("puck"));
        assert!(!is_supported_voice("Alloy"));
    }

    #[test]
    fn test_setup_message_shape() {
        let mut config = GeminiLiveConfig::new("key", "gemini-2.0-flash-live-001", "Kore");
        config.system_instruction = Some("Be brief.".to_string());
        config.tools = vec![json!({"name": "trigger_dance_mode"})];

        let value = serde_json::to_value(config.setup_message()).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(setup["tools"][0]["functionDeclarations"][0]["name"], "trigger_dance_mode");
        assert_eq!(setup["outputAudioTranscription"], json!({}));
        assert_eq!(
            setup["realtimeInputConfig"]["automaticActivityDetection"]["silenceDurationMs"],
            200
        );
    }

    #[test]
    fn test_setup_message_omits_disabled_features() {
        let mut config = GeminiLiveConfig::new("key", "models/custom", "Puck");
        config.output_transcription = false;
        config.vad = None;

        let value = serde_json::to_value(config.setup_message()).unwrap();
        let setup = value["setup"].as_object().unwrap();
        assert_eq!(setup["model"], "models/custom");
        assert!(!setup.contains_key("outputAudioTranscription"));
        assert!(!setup.contains_key("realtimeInputConfig"));
        assert!(!setup.contains_key("tools"));
        assert!(!setup.contains_key("systemInstruction"));
    }

    #[test]
    fn test_close_reason_classification() {
        assert!(matches!(classify_close(""), RelayError::TransportClosed));
        assert!(matches!(
            classify_close("RESOURCE_EXHAUSTED: quota"),
            RelayError::UpstreamCapacity(_)
        ));
        let other = classify_close("Internal error");
        assert!(matches!(other, RelayError::Unclassified(_)));
        assert!(other.to_string().contains("Internal error"));
    }

    #[tokio::test]
    async fn test_turn_stream_ends_at_turn_complete() {
        let (tx, rx) = mpsc::channel(8);
        let queue = EventQueue::new(rx);
        tx.send(Ok(content(false))).await.unwrap();
        tx.send(Ok(content(true))).await.unwrap();
        tx.send(Ok(ServerEvent::GoAway)).await.unwrap();

        let first_turn: Vec<_> = queue.turn_stream().collect().await;
        assert_eq!(first_turn.len(), 2);
        assert!(first_turn[1].as_ref().unwrap().is_turn_complete());

        let mut next = queue.turn_stream();
        assert!(matches!(next.next().await, Some(Ok(ServerEvent::GoAway))));
    }

    #[tokio::test]
    async fn test_turn_stream_reports_closed_transport() {
        let (tx, rx) = mpsc::channel(8);
        let queue = EventQueue::new(rx);
        drop(tx);

        let items: Vec<_> = queue.turn_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(RelayError::TransportClosed)));
    }
}
