//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session registry
//! and the factory for upstream live sessions.

use crate::config::RelaySettings;
use avatar_core::{realtime_api::LiveConnector, registry::SessionRegistry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn LiveConnector>,
    pub relay: Arc<RelaySettings>,
    /// Sent upstream once per session before the client is told it is ready.
    pub preamble: Option<Arc<String>>,
}
