//! Hand-written doubles shared by the relay and supervisor tests.

use super::{client::ClientSink, protocol::ServerMessage};
use async_trait::async_trait;
use avatar_core::{
    RelayError,
    generic_types::{FunctionResponse, LiveInput, ServerEvent},
    realtime_api::{EventStream, LiveConnector, LiveSession},
};
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Records every frame sent to the client.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<ServerMessage>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn send_message(&mut self, msg: &ServerMessage) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::TransportClosed);
        }
        self.sent.lock().push(msg.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type Batch = Vec<Result<ServerEvent, RelayError>>;

/// A live session that replays scripted event batches, one per `receive()`
/// call, and records everything sent to it. Once the script runs out,
/// `receive()` returns a stream that never yields.
#[derive(Default)]
pub struct ScriptedLive {
    script: Mutex<VecDeque<Batch>>,
    sent: Mutex<Vec<(LiveInput, bool)>>,
    tool_responses: Mutex<Vec<FunctionResponse>>,
    send_delay: Option<Duration>,
    closed: AtomicBool,
}

impl ScriptedLive {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            script: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    /// Every `send` sleeps this long before succeeding.
    pub fn stalling(delay: Duration) -> Self {
        Self {
            send_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(LiveInput, bool)> {
        self.sent.lock().clone()
    }

    pub fn tool_responses(&self) -> Vec<FunctionResponse> {
        self.tool_responses.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveSession for ScriptedLive {
    async fn send(&self, input: LiveInput, end_of_turn: bool) -> Result<(), RelayError> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push((input, end_of_turn));
        Ok(())
    }

    async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<(), RelayError> {
        self.tool_responses.lock().extend(responses);
        Ok(())
    }

    fn receive(&self) -> EventStream {
        match self.script.lock().pop_front() {
            Some(batch) => stream::iter(batch).boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one prepared [`ScriptedLive`].
pub struct ScriptedConnector {
    live: Arc<ScriptedLive>,
}

impl ScriptedConnector {
    pub fn new(live: Arc<ScriptedLive>) -> Self {
        Self { live }
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn LiveSession>, RelayError> {
        Ok(self.live.clone())
    }
}

/// A connector whose upstream is always out of quota.
pub struct ExhaustedConnector;

#[async_trait]
impl LiveConnector for ExhaustedConnector {
    async fn connect(&self) -> Result<Arc<dyn LiveSession>, RelayError> {
        Err(RelayError::from_upstream_message("RESOURCE_EXHAUSTED: quota"))
    }
}
