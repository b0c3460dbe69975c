//! Defines the WebSocket message protocol between the browser client and the relay.
//!
//! Every frame in either direction is a JSON object of the form
//! `{"type": ..., "data": ...}`. Inbound frames are validated by hand so that a
//! malformed frame can be answered with a typed error instead of tearing the
//! connection down.

use avatar_core::{RelayError, generic_types::FunctionResponse};
use serde::Serialize;
use serde_json::Value;

/// Messages sent from the client (browser) to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Base64 encoded PCM audio.
    Audio(String),
    /// Base64 encoded JPEG frame.
    Image(String),
    Text(String),
    /// Results for one or more tool calls, forwarded upstream untouched.
    ToolResponse(Vec<FunctionResponse>),
    /// Barge-in: the user started talking over the model.
    Interrupt,
    End,
}

impl ClientMessage {
    /// Parses and validates one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(raw)?;
        let envelope = value
            .as_object()
            .ok_or_else(|| RelayError::InvalidMessage("Message must be a JSON object".to_string()))?;
        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::InvalidMessage("Missing or invalid message type".to_string()))?;
        let data = envelope.get("data").filter(|d| !d.is_null());

        match kind {
            "audio" => Ok(ClientMessage::Audio(required_string(kind, data)?)),
            "image" => Ok(ClientMessage::Image(required_string(kind, data)?)),
            "text" => Ok(ClientMessage::Text(required_string(kind, data)?)),
            "tool_response" => {
                let data = data.ok_or_else(|| missing_data(kind))?;
                let responses = match data {
                    Value::Array(_) => serde_json::from_value::<Vec<FunctionResponse>>(data.clone())?,
                    _ => vec![serde_json::from_value::<FunctionResponse>(data.clone())?],
                };
                Ok(ClientMessage::ToolResponse(responses))
            }
            "interrupt" => Ok(ClientMessage::Interrupt),
            "end" => Ok(ClientMessage::End),
            other => Err(RelayError::InvalidMessage(format!(
                "Unknown message type: {other}"
            ))),
        }
    }

    /// The wire name of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Audio(_) => "audio",
            ClientMessage::Image(_) => "image",
            ClientMessage::Text(_) => "text",
            ClientMessage::ToolResponse(_) => "tool_response",
            ClientMessage::Interrupt => "interrupt",
            ClientMessage::End => "end",
        }
    }
}

fn missing_data(kind: &str) -> RelayError {
    RelayError::InvalidMessage(format!("Missing data for {kind} message"))
}

fn required_string(kind: &str, data: Option<&Value>) -> Result<String, RelayError> {
    match data {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(RelayError::InvalidMessage(format!(
            "Data for {kind} message must be a string"
        ))),
        None => Err(missing_data(kind)),
    }
}

/// A tool call forwarded to the client so it can react (animations, UI state).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolCallNotice {
    pub name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// RFC 3339 time at which the call was forwarded.
    pub timestamp: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidMessage,
    Timeout,
    SizeLimitExceeded,
    QuotaExceeded,
    General,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    pub error_type: ErrorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ErrorPayload {
    pub fn from_error(err: &RelayError) -> Self {
        let (message, error_type, action) = match err {
            RelayError::InvalidMessage(_) | RelayError::InvalidSessionId => {
                (err.to_string(), ErrorType::InvalidMessage, None)
            }
            RelayError::SizeLimitExceeded(msg) => (msg.clone(), ErrorType::SizeLimitExceeded, None),
            RelayError::Timeout => (err.to_string(), ErrorType::Timeout, None),
            RelayError::UpstreamCapacity(_) => (
                "API quota exceeded.".to_string(),
                ErrorType::QuotaExceeded,
                Some("Please wait and try again.".to_string()),
            ),
            RelayError::TransportClosed | RelayError::Unclassified(_) => {
                ("An error occurred".to_string(), ErrorType::General, None)
            }
        };
        Self {
            message,
            error_type,
            action,
        }
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The relay is wired up and accepting input.
    Ready { session_id: String },
    /// The upstream session acknowledged its setup.
    SetupComplete,
    ToolCall(ToolCallNotice),
    /// Base64 encoded PCM audio from the model.
    Audio(String),
    Text(String),
    Interrupted { message: String },
    /// One caption fragment, sent as soon as it arrives.
    TranscriptionInterim(String),
    /// The full caption for the finished turn.
    Transcription(String),
    TurnComplete,
    GoAway { message: String },
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(err: &RelayError) -> Self {
        ServerMessage::Error(ErrorPayload::from_error(err))
    }

    /// The error category, if this is an error frame.
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            ServerMessage::Error(payload) => Some(payload.error_type),
            _ => None,
        }
    }
}
