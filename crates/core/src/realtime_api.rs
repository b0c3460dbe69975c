//! The seam between the relay and a live AI streaming service.

use crate::{
    error::RelayError,
    generic_types::{FunctionResponse, LiveInput, ServerEvent},
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// A lazily produced sequence of upstream events.
///
/// A stream may end after one model turn; callers that want to keep listening
/// call [`LiveSession::receive`] again.
pub type EventStream = BoxStream<'static, Result<ServerEvent, RelayError>>;

/// One open streaming session with the external AI service.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Sends client input upstream. `end_of_turn` marks the input as complete.
    async fn send(&self, input: LiveInput, end_of_turn: bool) -> Result<(), RelayError>;

    /// Answers one or more tool calls.
    async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<(), RelayError>;

    /// Returns the next run of upstream events.
    ///
    /// Once the underlying transport is gone the stream yields
    /// [`RelayError::TransportClosed`].
    fn receive(&self) -> EventStream;

    /// Releases the upstream connection.
    async fn close(&self) -> Result<(), RelayError>;
}

/// Opens new [`LiveSession`]s, one per client connection.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn LiveSession>, RelayError>;
}
