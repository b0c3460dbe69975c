//! The duplex relay: one pump per direction between a client connection and
//! its live upstream session.

use super::{
    client::ClientTx,
    protocol::{ClientMessage, ServerMessage, ToolCallNotice},
};
use crate::config::RelaySettings;
use avatar_core::{
    RelayError,
    generic_types::{ContentPart, FunctionCall, FunctionResponse, LiveInput, ServerContent, ServerEvent},
    realtime_api::LiveSession,
    registry::SessionRegistry,
    session::SessionState,
};
use axum::extract::ws::Message;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::{ops::ControlFlow, sync::Arc};
use tokio::time::{Instant, timeout};
use tracing::{Instrument, debug, info, warn};

/// Everything both pumps share for the lifetime of one connection.
#[derive(Clone)]
pub struct RelayContext {
    pub session: Arc<SessionState>,
    pub registry: Arc<SessionRegistry>,
    pub live: Arc<dyn LiveSession>,
    pub client: ClientTx,
    pub settings: Arc<RelaySettings>,
}

impl RelayContext {
    async fn reply_error(&self, err: &RelayError) -> Result<(), RelayError> {
        self.client.send(ServerMessage::error(err)).await
    }

    async fn send_upstream(&self, input: LiveInput, end_of_turn: bool) -> Result<(), RelayError> {
        timeout(self.settings.send_timeout, self.live.send(input, end_of_turn)).await?
    }

    async fn send_tool_responses(&self, responses: Vec<FunctionResponse>) -> Result<(), RelayError> {
        timeout(
            self.settings.send_timeout,
            self.live.send_tool_response(responses),
        )
        .await?
    }

    async fn handle_client_text(&self, raw: &str) -> Result<(), RelayError> {
        self.registry.touch_activity(self.session.id()).await;
        let count = self.session.record_message();

        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Rejected client message");
                return self.reply_error(&e).await;
            }
        };
        let kind = message.kind();
        debug!(kind, message_count = count, "Client message received");

        match self.dispatch_client(message).await {
            Ok(()) => Ok(()),
            Err(RelayError::UpstreamCapacity(reason)) => {
                warn!(kind, %reason, "Upstream quota exceeded");
                self.reply_error(&RelayError::UpstreamCapacity(reason))
                    .await
            }
            Err(e) if e.is_recoverable() => {
                warn!(kind, error = %e, "Client message not forwarded");
                self.reply_error(&e).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch_client(&self, message: ClientMessage) -> Result<(), RelayError> {
        let session = &self.session;
        let settings = &self.settings;

        match message {
            ClientMessage::Audio(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                let estimated = data.len() * 3 / 4;
                if estimated > settings.max_audio_bytes {
                    return Err(RelayError::SizeLimitExceeded(format!(
                        "Audio data too large: {estimated} bytes (max {})",
                        settings.max_audio_bytes
                    )));
                }
                if session.take_client_interrupted() {
                    debug!("New audio after interrupt, resuming model output");
                }
                let cleared = session.reset_transcriptions_for_new_turn();
                if cleared > 0 {
                    debug!(cleared, "Cleared stale transcription fragments for new turn");
                }
                self
                    .send_upstream(
                        LiveInput::Audio {
                            data,
                            mime_type: settings.audio_mime_type.clone(),
                        },
                        true,
                    )
                    .await
            }
            ClientMessage::Image(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                let estimated = data.len() * 3 / 4;
                if estimated > settings.max_image_bytes {
                    return Err(RelayError::SizeLimitExceeded(format!(
                        "Image data too large: {estimated} bytes (max {})",
                        settings.max_image_bytes
                    )));
                }
                self
                    .send_upstream(
                        LiveInput::Image {
                            data,
                            mime_type: settings.image_mime_type.clone(),
                        },
                        false,
                    )
                    .await
            }
            ClientMessage::Text(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                let chars = text.chars().count();
                if chars > settings.max_text_chars {
                    return Err(RelayError::SizeLimitExceeded(format!(
                        "Text too long: {chars} characters (max {})",
                        settings.max_text_chars
                    )));
                }
                self.send_upstream(LiveInput::Text(text), true).await
            }
            ClientMessage::ToolResponse(responses) => {
                debug!(count = responses.len(), "Forwarding tool responses");
                self.send_tool_responses(responses).await
            }
            ClientMessage::Interrupt => {
                session.set_client_interrupted(true);
                let cleared = session.clear_transcriptions();
                info!(cleared, "Client interrupted model output");
                Ok(())
            }
            ClientMessage::End => Ok(()),
        }
    }
}

/// Reads client frames and forwards them upstream.
pub struct InboundPump<S> {
    ctx: RelayContext,
    frames: S,
}

impl<S> InboundPump<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    pub fn new(ctx: RelayContext, frames: S) -> Self {
        Self { ctx, frames }
    }

    /// Runs until the client goes away or the connection is force-closed.
    pub async fn run(self) -> Result<(), RelayError> {
        let Self { ctx, mut frames } = self;
        let connection = ctx.session.connection();
        loop {
            let frame = tokio::select! {
                _ = connection.closed() => {
                    info!("Connection superseded, closing inbound pump");
                    return Ok(());
                }
                frame = frames.next() => frame,
            };

            match frame {
                None => {
                    debug!("Client stream ended");
                    return Ok(());
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Client transport error");
                    return Err(RelayError::TransportClosed);
                }
                Some(Ok(Message::Text(text))) => ctx.handle_client_text(text.as_str()).await?,
                Some(Ok(Message::Binary(_))) => {
                    ctx.registry.touch_activity(ctx.session.id()).await;
                    ctx.session.record_message();
                    let err = RelayError::InvalidMessage("Binary frames are not supported".to_string());
                    warn!(error = %err, "Rejected client frame");
                    ctx.reply_error(&err).await?;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Client sent close frame");
                    return Ok(());
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Reads upstream events and forwards them to the client.
pub struct OutboundPump {
    ctx: RelayContext,
}

impl OutboundPump {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    /// Consumes turn after turn until the upstream goes away.
    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let mut events = self.ctx.live.receive();
            while let Some(event) = events.next().await {
                let outcome = match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => return Ok(()),
                    Err(RelayError::UpstreamCapacity(reason)) => {
                        warn!(%reason, "Upstream quota exceeded");
                        self.ctx
                            .reply_error(&RelayError::UpstreamCapacity(reason))
                            .await?;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, "Upstream event not fully handled");
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::task::yield_now().await;
        }
    }

    pub async fn handle_event(&self, event: ServerEvent) -> Result<ControlFlow<()>, RelayError> {
        match event {
            ServerEvent::SetupComplete => {
                self.ctx.client.send(ServerMessage::SetupComplete).await?;
            }
            ServerEvent::ToolCall { calls } => {
                for call in calls {
                    self.handle_tool_call(call).await?;
                }
            }
            ServerEvent::ServerContent(content) => self.handle_content(content).await?,
            ServerEvent::UsageMetadata { total_tokens } => {
                self.ctx.session.set_total_tokens(total_tokens);
                debug!(total_tokens, "Usage updated");
            }
            ServerEvent::GoAway => {
                info!("Upstream is going away");
                self.ctx
                    .client
                    .send(ServerMessage::GoAway {
                        message: "Session ending, please reconnect".to_string(),
                    })
                    .await?;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_tool_call(&self, call: FunctionCall) -> Result<(), RelayError> {
        let FunctionCall { id, name, args } = call;

        if !self.ctx.session.accept_tool_call(&name, Instant::now()) {
            info!(tool = %name, "Skipping duplicate tool call within cooldown");
            return self
                .ctx
                .send_tool_responses(vec![FunctionResponse::new(
                    id,
                    name,
                    json!({"success": false, "reason": "duplicate-within-cooldown"}),
                )])
                .await;
        }

        info!(tool = %name, "Forwarding tool call");
        let notice = ToolCallNotice {
            name: name.clone(),
            args,
            id: id.clone(),
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.ctx.client.send(ServerMessage::ToolCall(notice)).await {
            warn!(tool = %name, error = %e, "Failed to forward tool call to client");
        }
        self.ctx
            .send_tool_responses(vec![FunctionResponse::new(id, name, json!({"success": true}))])
            .await
    }

    async fn handle_content(&self, content: ServerContent) -> Result<(), RelayError> {
        let session = &self.ctx.session;
        let client = &self.ctx.client;
        let captions = self.ctx.settings.captions_enabled;

        if session.skips_initial_greeting() {
            if content.turn_complete {
                session.set_skip_initial_greeting(false);
                debug!("Initial greeting suppressed");
            }
            return Ok(());
        }

        if content.interrupted {
            info!("Model output interrupted");
            client
                .send(ServerMessage::Interrupted {
                    message: "Response interrupted by user".to_string(),
                })
                .await?;
            session.set_receiving_response(false);
            session.set_client_interrupted(false);
            session.clear_transcriptions();
            return Ok(());
        }

        if session.is_client_interrupted() {
            debug!("Dropping model output after client interrupt");
            return Ok(());
        }

        if !content.parts.is_empty() {
            session.set_receiving_response(true);
        }
        for part in content.parts {
            if session.is_client_interrupted() {
                debug!("Client interrupted mid-turn, dropping remaining parts");
                return Ok(());
            }
            match part {
                ContentPart::Audio(bytes) => {
                    client.send(ServerMessage::Audio(STANDARD.encode(&bytes))).await?
                }
                ContentPart::Text(text) => client.send(ServerMessage::Text(text)).await?,
            }
        }

        if let Some(fragment) = content.output_transcription {
            let fragment = fragment.trim();
            if captions && !fragment.is_empty() {
                let total = session.push_transcription(fragment);
                debug!(fragments = total, "Transcription fragment received");
                client
                    .send(ServerMessage::TranscriptionInterim(fragment.to_string()))
                    .await?;
            }
        }

        if content.turn_complete {
            let fragments = session.take_transcriptions();
            if captions && !fragments.is_empty() {
                client
                    .send(ServerMessage::Transcription(fragments.join(" ")))
                    .await?;
            }
            client.send(ServerMessage::TurnComplete).await?;
            session.set_receiving_response(false);
            session.set_client_interrupted(false);
        }
        Ok(())
    }
}

/// Runs both pumps concurrently; the first to finish cancels the other.
pub struct DuplexRelay<S> {
    ctx: RelayContext,
    frames: S,
}

impl<S> DuplexRelay<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    pub fn new(ctx: RelayContext, frames: S) -> Self {
        Self { ctx, frames }
    }

    pub async fn run(self) -> Result<(), RelayError> {
        let ctx = self.ctx;
        let mut inbound = tokio::spawn(
            InboundPump::new(ctx.clone(), self.frames)
                .run()
                .in_current_span(),
        );
        let mut outbound = tokio::spawn(OutboundPump::new(ctx.clone()).run().in_current_span());

        let (side, joined) = tokio::select! {
            res = &mut inbound => ("inbound", res),
            res = &mut outbound => ("outbound", res),
        };
        let sibling = if side == "inbound" { outbound } else { inbound };
        sibling.abort();
        let _ = sibling.await;
        debug!(side, "Relay pump finished first");

        let result = joined.unwrap_or_else(|e| {
            Err(RelayError::Unclassified(anyhow::anyhow!(
                "{side} pump failed: {e}"
            )))
        });

        match result {
            Ok(()) => Ok(()),
            Err(RelayError::UpstreamCapacity(reason)) => {
                warn!(%reason, "Upstream quota exceeded, closing relay");
                let _ = ctx
                    .reply_error(&RelayError::UpstreamCapacity(reason))
                    .await;
                Ok(())
            }
            Err(RelayError::TransportClosed) => {
                debug!("Transport closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
