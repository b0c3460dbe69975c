//! The outbound half of a client connection.

use super::protocol::ServerMessage;
use async_trait::async_trait;
use avatar_core::RelayError;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Anything that can carry [`ServerMessage`]s to the browser.
#[async_trait]
pub trait ClientSink: Send {
    async fn send_message(&mut self, msg: &ServerMessage) -> Result<(), RelayError>;
    async fn close(&mut self) -> Result<(), RelayError>;
}

#[async_trait]
impl ClientSink for SplitSink<WebSocket, Message> {
    async fn send_message(&mut self, msg: &ServerMessage) -> Result<(), RelayError> {
        let serialized = serde_json::to_string(msg)
            .map_err(|e| RelayError::Unclassified(anyhow::Error::new(e)))?;
        self.send(Message::Text(serialized.into()))
            .await
            .map_err(|_| RelayError::TransportClosed)
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        SinkExt::close(self)
            .await
            .map_err(|_| RelayError::TransportClosed)
    }
}

/// A cloneable handle shared by both pumps; sends are serialized.
#[derive(Clone)]
pub struct ClientTx {
    inner: Arc<Mutex<Box<dyn ClientSink>>>,
}

impl ClientTx {
    pub fn new(sink: impl ClientSink + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub async fn send(&self, msg: ServerMessage) -> Result<(), RelayError> {
        self.inner.lock().await.send_message(&msg).await
    }

    /// Closes the transport. Closing an already closed transport is not an error.
    pub async fn close(&self) {
        if let Err(e) = self.inner.lock().await.close().await {
            debug!(error = %e, "Client transport already closed");
        }
    }
}
