//! Ask the research backend a question and print the answer as it streams.
//!
//! Run with:
//! ```bash
//! export PAPERCHAT_BACKEND_URL="http://localhost:8000"
//! cargo run --example ask -- "How do transformers handle long documents?"
//! ```

use std::io::Write;

use paperchat::options::ClientOptions;
use paperchat::store::FileStore;
use paperchat::{ConversationController, ConversationStore, StreamClient, StreamEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("usage: ask <question>");
        std::process::exit(2);
    }

    let client = StreamClient::new(ClientOptions::from_env())?;
    if let Err(e) = client.health().await {
        eprintln!("Backend is not healthy: {}", e);
        std::process::exit(1);
    }

    let store = match FileStore::default_location() {
        Some(dir) => ConversationStore::new(FileStore::new(dir)),
        None => ConversationStore::in_memory(),
    };
    let mut controller = ConversationController::new(client, store);

    controller.submit(&question);

    let mut printed = 0;
    while let Some(event) = controller.next_event().await {
        match event {
            StreamEvent::Update(snapshot) => {
                // Text only ever grows, print the new tail
                print!("{}", &snapshot.text[printed..]);
                printed = snapshot.text.len();
                std::io::stdout().flush()?;
            }
            StreamEvent::Completed(snapshot) => {
                println!("\n\n=== Sources ===");
                for source in &snapshot.sources {
                    println!("- {} ({})", source.title, source.pdf_url);
                }
                println!(
                    "\n=== Graph: {} nodes, {} edges ===",
                    snapshot.graph.nodes.len(),
                    snapshot.graph.edges.len()
                );
            }
            StreamEvent::Failed(message) => {
                eprintln!("\nError in stream: {}", message);
                std::process::exit(1);
            }
        }
    }

    if let Some(conversation) = controller.current() {
        println!("Saved to \"{}\" ({} messages)", conversation.title, conversation.messages.len());
    }
    Ok(())
}
