//! Per-connection session state.
//!
//! A [`SessionState`] is shared between the registry and the two relay pumps of
//! one connection. Flags and counters are atomics; everything else sits behind a
//! short `parking_lot` mutex that is never held across an `.await`.

use crate::{error::RelayError, realtime_api::LiveSession};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::{
    fmt,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use uuid::Uuid;

/// Minimum spacing between two tool calls of the same name.
pub const TOOL_CALL_DEBOUNCE: Duration = Duration::from_secs(2);

static UUID_V4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("UUIDv4 pattern is valid")
});

/// A validated UUIDv4 session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a fresh random id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts only the canonical hyphenated UUIDv4 form (any letter case),
    /// stored lowercased.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        if UUID_V4_PATTERN.is_match(raw) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(RelayError::InvalidSessionId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cloneable handle that lets another task force a client connection closed.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signals the owning connection to shut down. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// True when both handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct SessionInner {
    last_activity_at: DateTime<Utc>,
    user_id: Option<String>,
    user_email: Option<String>,
    connection: ConnectionHandle,
    live: Option<Arc<dyn LiveSession>>,
    output_transcriptions: Vec<String>,
    last_tool_call_name: Option<String>,
    last_tool_call_at: Option<Instant>,
}

/// Mutable record for one active client connection.
pub struct SessionState {
    id: SessionId,
    created_at: DateTime<Utc>,
    receiving_response: AtomicBool,
    client_interrupted: AtomicBool,
    skip_initial_greeting: AtomicBool,
    message_count: AtomicU64,
    total_tokens: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            receiving_response: AtomicBool::new(false),
            client_interrupted: AtomicBool::new(false),
            skip_initial_greeting: AtomicBool::new(true),
            message_count: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            inner: Mutex::new(SessionInner {
                last_activity_at: now,
                user_id: None,
                user_email: None,
                connection: ConnectionHandle::new(),
                live: None,
                output_transcriptions: Vec::new(),
                last_tool_call_name: None,
                last_tool_call_at: None,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // --- Activity ---

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.inner.lock().last_activity_at
    }

    pub(crate) fn mark_activity(&self, at: DateTime<Utc>) {
        self.inner.lock().last_activity_at = at;
    }

    /// Counts one inbound client message and returns the new total.
    pub fn record_message(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    pub fn set_total_tokens(&self, tokens: u64) {
        self.total_tokens.store(tokens, Ordering::Relaxed);
    }

    // --- Identity and ownership ---

    pub fn user_id(&self) -> Option<String> {
        self.inner.lock().user_id.clone()
    }

    pub fn user_email(&self) -> Option<String> {
        self.inner.lock().user_email.clone()
    }

    pub(crate) fn assign_user(&self, user_id: &str, user_email: &str, connection: ConnectionHandle) {
        let mut inner = self.inner.lock();
        inner.user_id = Some(user_id.to_string());
        inner.user_email = Some(user_email.to_string());
        inner.connection = connection;
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.inner.lock().connection.clone()
    }

    pub fn attach_live(&self, live: Arc<dyn LiveSession>) {
        self.inner.lock().live = Some(live);
    }

    pub fn live(&self) -> Option<Arc<dyn LiveSession>> {
        self.inner.lock().live.clone()
    }

    // --- Turn flags ---

    pub fn is_receiving_response(&self) -> bool {
        self.receiving_response.load(Ordering::SeqCst)
    }

    pub fn set_receiving_response(&self, value: bool) {
        self.receiving_response.store(value, Ordering::SeqCst);
    }

    pub fn is_client_interrupted(&self) -> bool {
        self.client_interrupted.load(Ordering::SeqCst)
    }

    pub fn set_client_interrupted(&self, value: bool) {
        self.client_interrupted.store(value, Ordering::SeqCst);
    }

    /// Clears the interrupt flag, returning whether it was set.
    pub fn take_client_interrupted(&self) -> bool {
        self.client_interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn skips_initial_greeting(&self) -> bool {
        self.skip_initial_greeting.load(Ordering::SeqCst)
    }

    pub fn set_skip_initial_greeting(&self, value: bool) {
        self.skip_initial_greeting.store(value, Ordering::SeqCst);
    }

    // --- Output transcription accumulator ---

    /// Appends a fragment and returns the number of fragments held.
    pub fn push_transcription(&self, fragment: impl Into<String>) -> usize {
        let mut inner = self.inner.lock();
        inner.output_transcriptions.push(fragment.into());
        inner.output_transcriptions.len()
    }

    /// Drains every accumulated fragment.
    pub fn take_transcriptions(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().output_transcriptions)
    }

    /// Discards every accumulated fragment, returning how many were dropped.
    pub fn clear_transcriptions(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.output_transcriptions.len();
        inner.output_transcriptions.clear();
        dropped
    }

    /// Clears leftover fragments when new client input starts a turn.
    ///
    /// Fragments still arriving for an in-flight response are kept.
    pub fn reset_transcriptions_for_new_turn(&self) -> usize {
        if self.is_receiving_response() {
            return 0;
        }
        self.clear_transcriptions()
    }

    pub fn transcription_count(&self) -> usize {
        self.inner.lock().output_transcriptions.len()
    }

    // --- Tool call debounce ---

    /// Applies the same-name debounce window to a tool call observed at `now`.
    ///
    /// Returns `true` if the call should be forwarded. Only accepted calls
    /// update the debounce state.
    pub fn accept_tool_call(&self, name: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let duplicate = inner.last_tool_call_name.as_deref() == Some(name)
            && inner
                .last_tool_call_at
                .is_some_and(|at| now.saturating_duration_since(at) < TOOL_CALL_DEBOUNCE);
        if !duplicate {
            inner.last_tool_call_name = Some(name.to_string());
            inner.last_tool_call_at = Some(now);
        }
        !duplicate
    }

    pub fn last_tool_call_name(&self) -> Option<String> {
        self.inner.lock().last_tool_call_name.clone()
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("user_id", &self.user_id())
            .field("message_count", &self.message_count())
            .field("receiving_response", &self.is_receiving_response())
            .field("client_interrupted", &self.is_client_interrupted())
            .finish_non_exhaustive()
    }
}
