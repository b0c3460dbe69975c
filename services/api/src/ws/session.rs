//! Manages the WebSocket connection lifecycle: session creation, upstream
//! setup, the duplex relay, and teardown.

use super::{
    client::ClientTx,
    protocol::ServerMessage,
    relay::{DuplexRelay, OutboundPump, RelayContext},
};
use crate::state::AppState;
use avatar_core::{
    RelayError,
    generic_types::{LiveInput, ServerEvent},
    realtime_api::LiveSession,
    session::{SessionId, SessionState},
};
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Optional identity carried on the upgrade request.
#[derive(Deserialize, Debug, Default)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// An authenticated user, enforced to at most one live session.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    pub user_id: String,
    pub email: String,
}

impl UserIdentity {
    /// Query parameters win over `x-user-id` / `x-user-email` headers.
    pub fn from_request(params: ConnectParams, headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let user_id = params
            .user_id
            .or_else(|| header("x-user-id"))
            .filter(|id| !id.trim().is_empty())?;
        let email = params
            .email
            .or_else(|| header("x-user-email"))
            .unwrap_or_default();
        Some(Self { user_id, email })
    }
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = UserIdentity::from_request(params, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<UserIdentity>) {
    let (socket_tx, socket_rx) = socket.split();
    run_connection(state, ClientTx::new(socket_tx), socket_rx, identity).await;
}

/// Drives one client connection from handshake to teardown.
///
/// The upstream session is closed, the client transport closed, and the
/// session removed from the registry on every exit path.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
pub async fn run_connection<S>(
    state: Arc<AppState>,
    client: ClientTx,
    frames: S,
    identity: Option<UserIdentity>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let session_id = SessionId::new_v4();
    tracing::Span::current().record("session_id", session_id.as_str());

    let session = match state.registry.create(session_id.as_str()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to create session");
            let _ = client.send(ServerMessage::error(&e)).await;
            client.close().await;
            return;
        }
    };
    info!("Client connected");

    if let Some(identity) = &identity {
        let previous = state
            .registry
            .register_user(
                session_id.as_str(),
                &identity.user_id,
                &identity.email,
                session.connection(),
            )
            .await;
        if let Some(previous) = previous {
            info!(user_email = %identity.email, "Closing superseded connection for user");
            previous.close();
        }
    }

    match serve(&state, &session, &client, frames).await {
        Ok(()) => {}
        Err(RelayError::TransportClosed) => debug!("Transport closed during session"),
        Err(e) => {
            error!(error = %e, "Session terminated with error");
            let _ = client.send(ServerMessage::error(&e)).await;
        }
    }

    if let Some(live) = session.live() {
        if let Err(e) = live.close().await {
            debug!(error = %e, "Upstream session already closed");
        }
    }
    client.close().await;
    state.registry.remove(session_id.as_str()).await;
    info!(
        messages = session.message_count(),
        total_tokens = session.total_tokens(),
        "Client disconnected"
    );
}

async fn serve<S>(
    state: &AppState,
    session: &Arc<SessionState>,
    client: &ClientTx,
    frames: S,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let live = state.connector.connect().await?;
    session.attach_live(live.clone());
    info!("Upstream live session opened");

    let ctx = RelayContext {
        session: session.clone(),
        registry: state.registry.clone(),
        live: live.clone(),
        client: client.clone(),
        settings: state.relay.clone(),
    };

    if let Some(early) = await_setup(live.as_ref(), client, state).await? {
        let flow = OutboundPump::new(ctx.clone()).handle_event(early).await?;
        if flow.is_break() {
            return Ok(());
        }
    }
    send_preamble(live.as_ref(), session, state).await?;

    client
        .send(ServerMessage::Ready {
            session_id: session.id().to_string(),
        })
        .await?;

    DuplexRelay::new(ctx, frames).run().await
}

/// Waits for the upstream setup acknowledgement. A slow upstream is tolerated:
/// on timeout the session proceeds without one. Any other first event is
/// handed back so the caller can relay it.
async fn await_setup(
    live: &dyn LiveSession,
    client: &ClientTx,
    state: &AppState,
) -> Result<Option<ServerEvent>, RelayError> {
    let mut events = live.receive();
    match timeout(state.relay.setup_timeout, events.next()).await {
        Ok(Some(Ok(ServerEvent::SetupComplete))) => {
            debug!("Upstream setup complete");
            client.send(ServerMessage::SetupComplete).await?;
            Ok(None)
        }
        Ok(Some(Ok(other))) => {
            warn!(event = ?other, "Expected setup acknowledgement, got another event");
            Ok(Some(other))
        }
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(RelayError::TransportClosed),
        Err(_) => {
            warn!(
                timeout_secs = state.relay.setup_timeout.as_secs(),
                "Timed out waiting for setup acknowledgement, continuing"
            );
            Ok(None)
        }
    }
}

/// Sends the configured preamble and drains the model's reply to it so the
/// client never hears it. Without a preamble there is nothing to suppress.
async fn send_preamble(
    live: &dyn LiveSession,
    session: &SessionState,
    state: &AppState,
) -> Result<(), RelayError> {
    let Some(preamble) = &state.preamble else {
        session.set_skip_initial_greeting(false);
        return Ok(());
    };

    timeout(
        state.relay.send_timeout,
        live.send(LiveInput::Text(preamble.to_string()), true),
    )
    .await??;

    let drain = async {
        let mut events = live.receive();
        while let Some(event) = events.next().await {
            if event?.is_turn_complete() {
                return Ok(true);
            }
        }
        Ok::<_, RelayError>(false)
    };
    match timeout(state.relay.setup_timeout, drain).await {
        Ok(Ok(true)) => {
            session.set_skip_initial_greeting(false);
            debug!("Preamble turn drained");
        }
        Ok(Ok(false)) => debug!("Preamble turn ended without completion"),
        Ok(Err(e)) => return Err(e),
        // The outbound pump keeps suppressing until the turn completes.
        Err(_) => warn!("Preamble turn still running, suppressing the remainder"),
    }
    Ok(())
}
