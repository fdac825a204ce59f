//! Data models for the query stream and the persisted conversation history.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::stream::StreamSnapshot;

/// Number of words kept when deriving a conversation title.
const TITLE_WORDS: usize = 6;

/// Title used until the first user message arrives.
pub const PLACEHOLDER_TITLE: &str = "New Conversation";

/// A paper chunk cited by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub paper_id: String,

    #[serde(rename = "paper_title")]
    pub title: String,

    pub pdf_url: String,

    pub chunk_text: String,
}

/// An entity in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A typed relationship between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub target: String,

    #[serde(rename = "type")]
    pub kind: String,
}

/// Full graph state as last sent by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// One decoded unit of the query stream.
///
/// `Metadata` and `Graph` replace the previous value wholesale, `Text` appends.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Metadata(Vec<Source>),
    Graph(GraphSnapshot),
    /// Backend reported a failure. Fatal for the stream.
    Error(String),
}

/// Reasons a single `data:` payload could not be turned into a [`Frame`].
///
/// None of these abort the stream; the offending frame is skipped.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame type `{0}`")]
    UnknownKind(String),

    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("frame has neither a type nor an error")]
    Untyped,
}

/// Wire shape of a frame. Every field is optional on the wire; the error frame
/// sent by the backend carries no `type` at all.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    chunk: Option<String>,
    sources: Option<Vec<Source>>,
    nodes: Option<Vec<Node>>,
    edges: Option<Vec<Edge>>,
    error: Option<String>,
}

impl TryFrom<WireFrame> for Frame {
    type Error = FrameError;

    fn try_from(wire: WireFrame) -> Result<Self, FrameError> {
        if let Some(error) = wire.error {
            return Ok(Frame::Error(error));
        }

        match wire.kind.as_deref() {
            Some("text") => wire.chunk.map(Frame::Text).ok_or(FrameError::MissingField {
                kind: "text",
                field: "chunk",
            }),
            Some("metadata") => wire
                .sources
                .map(Frame::Metadata)
                .ok_or(FrameError::MissingField {
                    kind: "metadata",
                    field: "sources",
                }),
            Some("graph") => match (wire.nodes, wire.edges) {
                (Some(nodes), Some(edges)) => Ok(Frame::Graph(GraphSnapshot { nodes, edges })),
                (None, _) => Err(FrameError::MissingField {
                    kind: "graph",
                    field: "nodes",
                }),
                (_, None) => Err(FrameError::MissingField {
                    kind: "graph",
                    field: "edges",
                }),
            },
            Some(other) => Err(FrameError::UnknownKind(other.to_string())),
            None => Err(FrameError::Untyped),
        }
    }
}

impl FromStr for Frame {
    type Err = FrameError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let wire: WireFrame = serde_json::from_str(payload)?;
        wire.try_into()
    }
}

/// Role of the message author.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single, immutable message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,

    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            sources: None,
            graph: None,
            timestamp: Utc::now(),
        }
    }

    /// Freeze a finished stream into an assistant message.
    ///
    /// Empty source lists and graphs are dropped so that `graph.is_some()` always
    /// means there is something to show.
    pub fn assistant(snapshot: StreamSnapshot) -> Self {
        let StreamSnapshot {
            text,
            sources,
            graph,
        } = snapshot;

        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: text,
            sources: (!sources.is_empty()).then_some(sources),
            graph: (!graph.is_empty()).then_some(graph),
            timestamp: Utc::now(),
        }
    }
}

/// A titled, append-only list of messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: PLACEHOLDER_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message. The first user message also fixes the title.
    pub fn push(&mut self, message: Message) {
        if self.messages.is_empty() && message.role == Role::User {
            self.title = derive_title(&message.content);
        }
        self.updated_at = message.timestamp.max(self.updated_at);
        self.messages.push(message);
    }

    /// Graph of the most recent assistant message that has one.
    pub fn latest_graph(&self) -> Option<&GraphSnapshot> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| m.graph.as_ref())
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Title from the first few words of `text`, with an ellipsis when truncated.
///
/// # Example
/// ```
/// use paperchat::model::derive_title;
///
/// assert_eq!(derive_title("What is a transformer?"), "What is a transformer?");
/// assert_eq!(
///     derive_title("one two three four five six seven"),
///     "one two three four five six..."
/// );
/// ```
pub fn derive_title(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return PLACEHOLDER_TITLE.to_string();
    }

    let title = words.iter().take(TITLE_WORDS).join(" ");
    if words.len() > TITLE_WORDS {
        format!("{}...", title)
    } else {
        title
    }
}
