//! Per-call streaming state, events and cancellation.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{Frame, GraphSnapshot, Source};

/// The three facets of an answer as known so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    /// Concatenation of every text chunk received
    pub text: String,
    /// Latest source list
    pub sources: Vec<Source>,
    /// Latest graph
    pub graph: GraphSnapshot,
}

impl StreamSnapshot {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.sources.is_empty() && self.graph.is_empty()
    }
}

/// Lifecycle of one query stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamStatus {
    #[default]
    Idle,
    Streaming,
    Done,
    Error(String),
    /// Superseded or cancelled by the caller. Never reported as an error.
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamStatus::Done | StreamStatus::Error(_) | StreamStatus::Cancelled
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            StreamStatus::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Notification delivered to the `send` callback.
///
/// A stream produces any number of `Update`s followed by exactly one
/// `Completed` or `Failed`, unless it is cancelled first.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Update(StreamSnapshot),
    Completed(StreamSnapshot),
    Failed(String),
}

/// What applying a frame did to the state.
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Fatal(String),
}

/// Accumulated answer plus status for a single call.
#[derive(Debug, Default)]
pub struct StreamState {
    pub snapshot: StreamSnapshot,
    pub status: StreamStatus,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame into the state.
    ///
    /// Text appends, metadata and graph replace wholesale, an error frame
    /// moves the state to `Error` and must end the stream.
    pub fn apply(&mut self, frame: Frame) -> Applied {
        match frame {
            Frame::Text(chunk) => self.snapshot.text.push_str(&chunk),
            Frame::Metadata(sources) => self.snapshot.sources = sources,
            Frame::Graph(graph) => self.snapshot.graph = graph,
            Frame::Error(message) => {
                self.status = StreamStatus::Error(message.clone());
                return Applied::Fatal(message);
            }
        }
        Applied::Changed
    }
}

/// Caller-side view of one `send` call.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: u64,
    token: CancellationToken,
    status: watch::Receiver<StreamStatus>,
}

impl StreamHandle {
    pub(crate) fn new(id: u64, token: CancellationToken, status: watch::Receiver<StreamStatus>) -> Self {
        Self { id, token, status }
    }

    /// Sequence number of the call within its client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status of the call.
    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Stop the call. No further events are delivered once this returns.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the call to reach a terminal status.
    pub async fn wait(&self) -> StreamStatus {
        let mut status = self.status.clone();
        if let Ok(terminal) = status.wait_for(StreamStatus::is_terminal).await {
            return terminal.clone();
        }

        // The task is gone without publishing a terminal status
        let last = status.borrow().clone();
        if last.is_terminal() {
            last
        } else {
            StreamStatus::Cancelled
        }
    }
}

/// Delivers events for one call, unless the call has been cancelled.
///
/// All emitters of a client share one gate. The token is checked while the
/// gate is held, so once `cancel()` has returned and another call has emitted,
/// the cancelled call can no longer get an event through.
pub(crate) struct Emitter<F> {
    id: u64,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
    on_event: F,
    finished: bool,
}

impl<F> Emitter<F>
where
    F: FnMut(StreamEvent) + Send,
{
    pub(crate) fn new(id: u64, token: CancellationToken, gate: Arc<Mutex<()>>, on_event: F) -> Self {
        Self {
            id,
            token,
            gate,
            on_event,
            finished: false,
        }
    }

    /// Returns false if the event was suppressed.
    pub(crate) fn emit(&mut self, event: StreamEvent) -> bool {
        if self.finished {
            return false;
        }

        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.token.is_cancelled() {
            debug!("Dropping event for cancelled stream {}", self.id);
            return false;
        }

        if matches!(event, StreamEvent::Completed(_) | StreamEvent::Failed(_)) {
            self.finished = true;
        }
        (self.on_event)(event);
        true
    }
}
