//! Conversation history and the hand-off from a live stream to a committed
//! assistant message.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::StreamClient;
use crate::model::{Conversation, GraphSnapshot, Message, Source};
use crate::store::{ConversationStore, Theme};
use crate::stream::{StreamEvent, StreamHandle, StreamSnapshot, StreamStatus};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Conversation {0} not found")]
    NotFound(String),
}

/// What the view layer should currently show for the answer in progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayState {
    pub text: String,
    pub sources: Vec<Source>,
    pub graph: GraphSnapshot,
    pub status: StreamStatus,
}

impl DisplayState {
    pub fn error(&self) -> Option<&str> {
        self.status.error_message()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

struct LiveStream {
    seq: u64,
    conversation_id: String,
    handle: StreamHandle,
}

/// Owns the conversation list and turns finished streams into messages.
///
/// Every mutation is written through to the [`ConversationStore`]. At most one
/// stream is live; submitting again, or switching away from the current
/// conversation, cancels it.
///
/// # Example
/// ```no_run
/// use paperchat::client::StreamClient;
/// use paperchat::conversation::ConversationController;
/// use paperchat::options::ClientOptions;
/// use paperchat::store::ConversationStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = StreamClient::new(ClientOptions::from_env())?;
///     let mut controller = ConversationController::new(client, ConversationStore::in_memory());
///
///     controller.submit("Which papers connect GNNs to molecule generation?");
///     while let Some(_event) = controller.next_event().await {
///         print!("\r{}", controller.display().text);
///     }
///     Ok(())
/// }
/// ```
pub struct ConversationController {
    client: StreamClient,
    store: ConversationStore,
    conversations: Vec<Conversation>,
    current_id: Option<String>,
    theme: Theme,
    display: DisplayState,
    live: Option<LiveStream>,
    next_seq: u64,
    events_tx: mpsc::UnboundedSender<(u64, StreamEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, StreamEvent)>,
}

impl ConversationController {
    /// Load persisted state and restore the graph of the current conversation.
    pub fn new(client: StreamClient, store: ConversationStore) -> Self {
        let conversations = store.load_conversations();
        let current_id = store
            .load_current_id()
            .filter(|id| conversations.iter().any(|c| &c.id == id));
        let theme = store.load_theme();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!("Loaded {} conversations", conversations.len());

        let mut controller = Self {
            client,
            store,
            conversations,
            current_id,
            theme,
            display: DisplayState::default(),
            live: None,
            next_seq: 0,
            events_tx,
            events_rx,
        };
        controller.restore_graph();
        controller
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        let id = self.current_id.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn is_streaming(&self) -> bool {
        self.live.is_some()
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
        self.store.save_theme(theme);
    }

    /// Start a new, empty conversation and make it current.
    pub fn create_conversation(&mut self) -> String {
        self.stop_live();

        let conversation = Conversation::new();
        let id = conversation.id.clone();
        debug!("Created conversation {}", id);

        self.conversations.insert(0, conversation);
        self.current_id = Some(id.clone());
        self.display.clear();

        self.store.save_conversations(&self.conversations);
        self.store.save_current_id(Some(&id));
        id
    }

    /// Record `text` as a user message and start streaming the answer.
    ///
    /// Blank input is ignored. Must be called from within a Tokio runtime.
    pub fn submit(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring blank submission");
            return;
        }

        let existing = self.current().map(|c| c.id.clone());
        let conversation_id = match existing {
            Some(id) => id,
            None => self.create_conversation(),
        };

        if let Some(conversation) = self.find_mut(&conversation_id) {
            conversation.push(Message::user(text));
        }
        self.store.save_conversations(&self.conversations);

        self.display.clear();
        self.display.status = StreamStatus::Streaming;

        self.next_seq += 1;
        let seq = self.next_seq;
        let events_tx = self.events_tx.clone();
        let handle = self.client.send(text, move |event| {
            // The receiver only goes away with the controller
            let _ = events_tx.send((seq, event));
        });

        self.live = Some(LiveStream {
            seq,
            conversation_id,
            handle,
        });
    }

    /// Make `id` current. Only the side graph is restored; text and sources
    /// stay cleared.
    pub fn select_conversation(&mut self, id: &str) -> Result<(), ConversationError> {
        if !self.conversations.iter().any(|c| c.id == id) {
            return Err(ConversationError::NotFound(id.to_string()));
        }
        if self.current_id.as_deref() == Some(id) {
            return Ok(());
        }

        self.stop_live();
        self.current_id = Some(id.to_string());
        self.display.clear();
        self.restore_graph();

        self.store.save_current_id(Some(id));
        Ok(())
    }

    /// Remove a conversation. Deleting the current one clears everything
    /// on display.
    pub fn delete_conversation(&mut self, id: &str) -> Result<(), ConversationError> {
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))?;

        self.conversations.remove(index);
        debug!("Deleted conversation {}", id);

        let streaming_into_it = self
            .live
            .as_ref()
            .is_some_and(|live| live.conversation_id == id);
        if streaming_into_it {
            self.stop_live();
        }

        if self.current_id.as_deref() == Some(id) {
            self.stop_live();
            self.current_id = None;
            self.display.clear();
            self.store.save_current_id(None);
        }

        self.store.save_conversations(&self.conversations);
        Ok(())
    }

    /// Wait for the next event of the live stream and apply it.
    ///
    /// Returns `None` once no stream is live.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            let (seq, handle) = {
                let live = self.live.as_ref()?;
                (live.seq, live.handle.clone())
            };

            tokio::select! {
                biased;
                received = self.events_rx.recv() => {
                    let (event_seq, event) = received?;
                    if event_seq != seq {
                        debug!("Discarding event of superseded stream {}", event_seq);
                        continue;
                    }
                    self.apply(event.clone());
                    return Some(event);
                }
                status = handle.wait() => {
                    // Ended without a final event, i.e. cancelled
                    debug!("Live stream ended as {:?}", status);
                    self.live = None;
                    if self.display.status == StreamStatus::Streaming {
                        self.display.status = StreamStatus::Idle;
                    }
                    return None;
                }
            }
        }
    }

    /// Drive the live stream until it ends and return the final status.
    pub async fn run_to_completion(&mut self) -> StreamStatus {
        while self.next_event().await.is_some() {}
        self.display.status.clone()
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Update(snapshot) => {
                self.display.text = snapshot.text;
                self.display.sources = snapshot.sources;
                self.display.graph = snapshot.graph;
                self.display.status = StreamStatus::Streaming;
            }
            StreamEvent::Completed(snapshot) => {
                if let Some(live) = self.live.take() {
                    self.commit(&live.conversation_id, snapshot);
                }
            }
            StreamEvent::Failed(message) => {
                // The user message stays; nothing partial is committed
                self.live = None;
                self.display.status = StreamStatus::Error(message);
            }
        }
    }

    fn commit(&mut self, conversation_id: &str, snapshot: StreamSnapshot) {
        self.display.text.clear();
        self.display.sources.clear();
        self.display.graph = snapshot.graph.clone();
        self.display.status = StreamStatus::Done;

        if snapshot.is_empty() {
            warn!("Stream finished without any content, nothing to commit");
            return;
        }

        let Some(conversation) = self.find_mut(conversation_id) else {
            warn!("Conversation {} vanished before its answer arrived", conversation_id);
            return;
        };
        conversation.push(Message::assistant(snapshot));
        self.store.save_conversations(&self.conversations);
    }

    fn stop_live(&mut self) {
        if let Some(live) = self.live.take() {
            debug!("Stopping live stream {}", live.seq);
            live.handle.cancel();
        }
    }

    fn restore_graph(&mut self) {
        self.display.graph = self
            .current()
            .and_then(Conversation::latest_graph)
            .cloned()
            .unwrap_or_default();
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }
}
