//! API Models
//!
//! Response bodies for the monitoring endpoints, with `utoipa` schemas for the
//! generated OpenAPI document.

use avatar_core::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

/// A point-in-time view of one active session.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionSummary {
    #[schema(example = "0b7f0a8e-3f4c-4d0e-9b1a-2c3d4e5f6a7b")]
    pub session_id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
    pub total_tokens: u64,
    pub receiving_response: bool,
}

impl From<&SessionState> for SessionSummary {
    fn from(session: &SessionState) -> Self {
        Self {
            session_id: session.id().to_string(),
            user_id: session.user_id(),
            user_email: session.user_email(),
            created_at: session.created_at(),
            last_activity_at: session.last_activity_at(),
            message_count: session.message_count(),
            total_tokens: session.total_tokens(),
            receiving_response: session.is_receiving_response(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_core::session::SessionId;

    #[test]
    fn test_summary_from_session_state() {
        let session = SessionState::new(SessionId::new_v4());
        session.record_message();
        session.record_message();
        session.set_total_tokens(99);
        session.set_receiving_response(true);

        let summary = SessionSummary::from(&session);
        assert_eq!(summary.session_id, session.id().as_str());
        assert_eq!(summary.user_id, None);
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.total_tokens, 99);
        assert!(summary.receiving_response);
        assert_eq!(summary.created_at, session.created_at());
    }

    #[test]
    fn test_summary_serialization() {
        let session = SessionState::new(SessionId::new_v4());
        let json = serde_json::to_value(SessionSummary::from(&session)).unwrap();

        assert_eq!(json["session_id"], session.id().as_str());
        assert!(json["user_email"].is_null());
        assert_eq!(json["message_count"], 0);
        assert_eq!(json["receiving_response"], false);
    }

    #[test]
    fn test_health_response_round_trip() {
        let health = HealthResponse {
            status: "ok".to_string(),
            active_sessions: 3,
            max_sessions: 1000,
        };
        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("\"active_sessions\":3"));
        let back: HealthResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, health);
    }
}
