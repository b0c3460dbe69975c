//! Gemini Live adapter.
//!
//! Implements the relay's [`avatar_core::realtime_api::LiveSession`] over the
//! Gemini Live `BidiGenerateContent` WebSocket endpoint.

mod session;
pub mod types;

pub use session::{
    GeminiConnector, GeminiLiveConfig, GeminiLiveSession, SUPPORTED_VOICES, VadSettings,
    is_supported_voice,
};
