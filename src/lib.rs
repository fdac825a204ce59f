//! # paperchat - Streaming research assistant client
//!
//! Client side of a graph-augmented paper search backend: issues a query,
//! consumes the answer as it streams in (text, cited sources and a knowledge
//! graph), and records finished answers into a persisted conversation history.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Incremental SSE decoding tolerant of arbitrary chunk boundaries
//! - Supersede-safe cancellation: a new query silences the previous one
//! - Explicit one-shot completion instead of status polling
//! - Pluggable key-value persistence
//!
//! ## Architecture
//!
//! - **[`StreamClient`]**: network call, decoding, frame parsing, cancellation
//! - **[`ConversationController`]**: conversation list, displayed stream state,
//!   committing finished streams as assistant messages
//! - **[`ConversationStore`]**: load/save of conversations, current id and theme
//!
//! ## Example
//! ```no_run
//! use paperchat::{ConversationController, ConversationStore, StreamClient};
//! use paperchat::options::ClientOptions;
//! use paperchat::store::FileStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = StreamClient::new(ClientOptions::new("http://localhost:8000"))?;
//!     let store = ConversationStore::new(FileStore::new("./.paperchat"));
//!     let mut controller = ConversationController::new(client, store);
//!
//!     controller.submit("How are graph neural networks used for drug discovery?");
//!     let status = controller.run_to_completion().await;
//!
//!     if let Some(answer) = controller.current().and_then(|c| c.messages.last()) {
//!         println!("{:?}: {}", status, answer.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod conversation;
pub mod http;
pub mod model;
pub mod options;
pub mod sse;
pub mod store;
pub mod stream;

// Re-exports for convenience
pub use client::{ClientError, StreamClient};
pub use conversation::{ConversationController, ConversationError, DisplayState};
pub use model::{Conversation, Frame, GraphSnapshot, Message, Role, Source};
pub use store::{ConversationStore, Theme};
pub use stream::{StreamEvent, StreamHandle, StreamSnapshot, StreamStatus};
