//! Provider-neutral types exchanged with a live AI session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Input sent upstream on behalf of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveInput {
    /// Base64 encoded PCM audio, passed through untouched.
    Audio { data: String, mime_type: String },
    /// Base64 encoded still image.
    Image { data: String, mime_type: String },
    /// A user text message.
    Text(String),
}

/// A single function invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// The answer to a [`FunctionCall`], sent back upstream.
///
/// Client-supplied responses are relayed as given: absent fields stay absent
/// and unknown fields ride along in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub response: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FunctionResponse {
    pub fn new(id: Option<String>, name: impl Into<String>, response: Value) -> Self {
        Self {
            id,
            name: name.into(),
            response,
            extra: Map::new(),
        }
    }
}

/// One chunk of model output inside a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    /// Raw (decoded) audio bytes.
    Audio(Bytes),
    Text(String),
}

/// Model output for (part of) a turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub parts: Vec<ContentPart>,
    pub interrupted: bool,
    pub turn_complete: bool,
    /// A fragment of the transcription of the model's spoken output.
    pub output_transcription: Option<String>,
}

/// Events a live session emits, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    ToolCall { calls: Vec<FunctionCall> },
    ServerContent(ServerContent),
    UsageMetadata { total_tokens: u64 },
    GoAway,
}

impl ServerEvent {
    /// True when this event closes the current model turn.
    pub fn is_turn_complete(&self) -> bool {
        matches!(self, ServerEvent::ServerContent(content) if content.turn_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_complete_detection() {
        let done = ServerEvent::ServerContent(ServerContent {
            turn_complete: true,
            ..Default::default()
        });
        assert!(done.is_turn_complete());
        assert!(!ServerEvent::ServerContent(ServerContent::default()).is_turn_complete());
        assert!(!ServerEvent::SetupComplete.is_turn_complete());
    }

    #[test]
    fn test_function_response_accepts_missing_id() {
        let parsed: FunctionResponse =
            serde_json::from_value(json!({"name": "trigger_dance_mode", "response": {"ok": 1}}))
                .unwrap();
        assert_eq!(parsed.id, None);
        assert_eq!(parsed.name, "trigger_dance_mode");

        let serialized = serde_json::to_value(&parsed).unwrap();
        assert!(serialized.get("id").is_none());
    }

    #[test]
    fn test_function_response_keeps_unknown_fields() {
        let raw = json!({
            "id": "c1",
            "name": "wave",
            "response": {"done": true},
            "scheduling": "INTERRUPT",
            "willContinue": false
        });
        let parsed: FunctionResponse = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.extra.get("scheduling"), Some(&json!("INTERRUPT")));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);

        let nameless: FunctionResponse =
            serde_json::from_value(json!({"id": "c2", "response": {}})).unwrap();
        assert_eq!(
            serde_json::to_value(&nameless).unwrap(),
            json!({"id": "c2", "response": {}})
        );
    }
}
