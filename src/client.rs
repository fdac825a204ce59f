//! Streaming query client and its error type.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{build_http_client, decorate};
use crate::model::Frame;
use crate::options::ClientOptions;
use crate::sse::SSEResponseExt;
use crate::stream::{Applied, Emitter, StreamEvent, StreamHandle, StreamState, StreamStatus};

/// Errors that can occur while talking to the backend.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("Unreadable response body: {0}")]
    Body(String),

    /// Failure reported by the backend inside the stream.
    #[error("{0}")]
    Backend(String),
}

impl ClientError {
    pub(crate) fn body(e: reqwest::Error) -> Self {
        ClientError::Body(e.to_string())
    }

    /// Build the error for a non-2xx answer, using the backend's `detail`
    /// field when the body carries one.
    fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<ErrorResponse>(body)
            .ok()
            .and_then(|e| e.detail.as_str().map(str::to_string))
            .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

        ClientError::Status { status, detail }
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest {
    query: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    detail: serde_json::Value,
}

/// Client for the streaming query endpoint.
///
/// Each [`send`](Self::send) starts a new call and supersedes the previous
/// one: the previous call is cancelled before the new one is spawned and can
/// deliver no further events.
///
/// # Example
/// ```no_run
/// use paperchat::client::StreamClient;
/// use paperchat::options::ClientOptions;
/// use paperchat::stream::StreamEvent;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut client = StreamClient::new(ClientOptions::from_env())?;
///
///     let handle = client.send("What is retrieval augmented generation?", |event| {
///         if let StreamEvent::Completed(answer) = event {
///             println!("{}", answer.text);
///         }
///     });
///
///     println!("finished with {:?}", handle.wait().await);
///     Ok(())
/// }
/// ```
pub struct StreamClient {
    http: reqwest::Client,
    options: ClientOptions,
    gate: Arc<Mutex<()>>,
    next_id: u64,
    active: Option<StreamHandle>,
}

impl StreamClient {
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let http = build_http_client(&options)?;
        Ok(Self {
            http,
            options,
            gate: Arc::new(Mutex::new(())),
            next_id: 0,
            active: None,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Start streaming the answer to `query`.
    ///
    /// Returns immediately. `on_event` receives snapshots in wire order,
    /// followed by one `Completed` or `Failed`. Must be called from within a
    /// Tokio runtime.
    pub fn send<F>(&mut self, query: impl Into<String>, on_event: F) -> StreamHandle
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.cancel();

        self.next_id += 1;
        let id = self.next_id;
        let token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(StreamStatus::Streaming);

        let request = decorate(self.http.post(self.options.query_url()), &self.options).json(&QueryRequest {
            query: query.into(),
        });
        let emitter = Emitter::new(id, token.clone(), self.gate.clone(), on_event);

        info!("Starting query stream {}", id);
        tokio::spawn(run_stream(id, request, token.clone(), status_tx, emitter));

        let handle = StreamHandle::new(id, token, status_rx);
        self.active = Some(handle.clone());
        handle
    }

    /// Cancel the most recent call, if it is still running.
    pub fn cancel(&mut self) {
        if let Some(active) = &self.active {
            if !active.status().is_terminal() {
                debug!("Cancelling query stream {}", active.id());
            }
            active.cancel();
        }
    }

    /// Status of the most recent call, `Idle` if there was none.
    pub fn status(&self) -> StreamStatus {
        self.active
            .as_ref()
            .map(StreamHandle::status)
            .unwrap_or_default()
    }

    /// Check that the backend is up.
    pub async fn health(&self) -> Result<(), ClientError> {
        let response = decorate(self.http.get(self.options.health_url()), &self.options)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, &body));
        }
        Ok(())
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_stream<F>(
    id: u64,
    request: RequestBuilder,
    token: CancellationToken,
    status_tx: watch::Sender<StreamStatus>,
    mut emitter: Emitter<F>,
) where
    F: FnMut(StreamEvent) + Send,
{
    let status = tokio::select! {
        biased;
        _ = token.cancelled() => StreamStatus::Cancelled,
        status = drive(id, request, &mut emitter) => status,
    };

    let status = if token.is_cancelled() {
        debug!("Query stream {} cancelled", id);
        StreamStatus::Cancelled
    } else {
        status
    };
    status_tx.send_replace(status);
}

async fn drive<F>(id: u64, request: RequestBuilder, emitter: &mut Emitter<F>) -> StreamStatus
where
    F: FnMut(StreamEvent) + Send,
{
    match consume(id, request, emitter).await {
        Ok(()) => StreamStatus::Done,
        Err(e) => {
            warn!("Query stream {} failed: {}", id, e);
            let message = e.to_string();
            emitter.emit(StreamEvent::Failed(message.clone()));
            StreamStatus::Error(message)
        }
    }
}

async fn consume<F>(id: u64, request: RequestBuilder, emitter: &mut Emitter<F>) -> Result<(), ClientError>
where
    F: FnMut(StreamEvent) + Send,
{
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_status(status, &body));
    }
    if status == StatusCode::NO_CONTENT {
        return Err(ClientError::Body("response has no body".to_string()));
    }

    let payloads = response.sse();
    futures::pin_mut!(payloads);

    let mut state = StreamState::new();
    while let Some(payload) = payloads.next().await {
        let payload = payload?;

        let frame = match payload.parse::<Frame>() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping frame in query stream {}: {}", id, e);
                continue;
            }
        };

        match state.apply(frame) {
            Applied::Changed => {
                emitter.emit(StreamEvent::Update(state.snapshot.clone()));
            }
            Applied::Fatal(message) => return Err(ClientError::Backend(message)),
        }
    }

    info!(
        "Query stream {} complete: {} chars, {} sources, {} nodes",
        id,
        state.snapshot.text.len(),
        state.snapshot.sources.len(),
        state.snapshot.graph.nodes.len()
    );
    emitter.emit(StreamEvent::Completed(state.snapshot));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSnapshot;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type Recorded = Arc<Mutex<Vec<StreamEvent>>>;

    fn recorder() -> (Recorded, impl FnMut(StreamEvent) + Send + 'static) {
        let events: Recorded = Arc::default();
        let sink = events.clone();
        (events, move |event: StreamEvent| sink.lock().unwrap().push(event))
    }

    fn sse(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("{}\n\n", l)).collect()
    }

    async fn serve(server: &MockServer, body: String) {
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(server)
            .await;
    }

    fn client_for(server: &MockServer) -> StreamClient {
        StreamClient::new(ClientOptions::new(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_full_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_json(json!({"query": "what is attention?"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[
                    r#"data: {"type": "graph", "nodes": [{"id": "Attention", "type": "Method"}], "edges": []}"#,
                    r#"data: {"type": "metadata", "sources": [{"paper_id": "1706.03762", "paper_title": "Attention Is All You Need", "pdf_url": "https://arxiv.org/pdf/1706.03762", "chunk_text": "The Transformer..."}]}"#,
                    r#"data: {"type": "text", "chunk": "Attention "}"#,
                    r#"data: {"type": "text", "chunk": "weighs tokens."}"#,
                    "event: end\ndata: [DONE]",
                ]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("what is attention?", on_event);

        assert_eq!(handle.wait().await, StreamStatus::Done);
        assert_eq!(client.status(), StreamStatus::Done);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 5);
        assert!(events[..4].iter().all(|e| matches!(e, StreamEvent::Update(_))));

        let StreamEvent::Update(first) = &events[0] else {
            panic!("expected update");
        };
        assert_eq!(first.graph.nodes[0].id, "Attention");
        assert!(first.text.is_empty());

        let StreamEvent::Completed(answer) = &events[4] else {
            panic!("expected completion, got {:?}", events[4]);
        };
        assert_eq!(answer.text, "Attention weighs tokens.");
        assert_eq!(answer.sources[0].title, "Attention Is All You Need");
        assert_eq!(answer.graph.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let server = MockServer::start().await;
        serve(
            &server,
            sse(&[
                r#"data: {"type": "text", "chunk": "before "}"#,
                r#"data: {"type": "text", "chunk": "#,
                r#"data: {"type": "text", "chunk": "after"}"#,
                "data: [DONE]",
            ]),
        )
        .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        assert_eq!(handle.wait().await, StreamStatus::Done);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Completed(StreamSnapshot {
                text: "before after".to_string(),
                ..Default::default()
            }))
        );
    }

    #[tokio::test]
    async fn test_nothing_after_done_marker() {
        let server = MockServer::start().await;
        serve(
            &server,
            [
                r#"data: {"type": "text", "chunk": "kept"}"#,
                "data: [DONE]",
                r#"data: {"type": "text", "chunk": "ignored"}"#,
            ]
            .join("\n"),
        )
        .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        assert_eq!(handle.wait().await, StreamStatus::Done);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        let StreamEvent::Completed(answer) = &events[1] else {
            panic!("expected completion");
        };
        assert_eq!(answer.text, "kept");
    }

    #[tokio::test]
    async fn test_body_close_without_marker_completes() {
        let server = MockServer::start().await;
        // Last record is not even newline-terminated
        serve(
            &server,
            r#"data: {"type": "text", "chunk": "a"}
data: {"type": "text", "chunk": "b"}"#
                .to_string(),
        )
        .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        assert_eq!(handle.wait().await, StreamStatus::Done);
        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(StreamEvent::Completed(s)) if s.text == "ab"));
    }

    #[tokio::test]
    async fn test_error_frame_fails_stream() {
        let server = MockServer::start().await;
        serve(
            &server,
            sse(&[
                r#"data: {"type": "text", "chunk": "partial"}"#,
                r#"data: {"error": "Something went wrong"}"#,
                r#"data: {"type": "text", "chunk": "never"}"#,
                "event: end\ndata: [DONE]",
            ]),
        )
        .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        assert_eq!(
            handle.wait().await,
            StreamStatus::Error("Something went wrong".to_string())
        );
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Failed("Something went wrong".to_string()));
    }

    #[tokio::test]
    async fn test_http_error_embeds_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(json!({"detail": "Database connection not available."})),
            )
            .mount(&server)
            .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        let status = handle.wait().await;
        let message = status.error_message().expect("stream should fail");
        assert!(message.contains("503"), "{}", message);
        assert!(message.contains("Database connection not available."), "{}", message);

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), &[StreamEvent::Failed(message.to_string())]);
    }

    #[tokio::test]
    async fn test_connection_failure_is_an_error() {
        let mut client = StreamClient::new(ClientOptions::new("http://127.0.0.1:1")).unwrap();
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);

        assert!(matches!(handle.wait().await, StreamStatus::Error(_)));
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [StreamEvent::Failed(_)]
        ));
    }

    #[tokio::test]
    async fn test_second_send_supersedes_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_json(json!({"query": "slow"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&[r#"data: {"type": "text", "chunk": "stale"}"#]), "text/event-stream")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_json(json!({"query": "fast"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&[r#"data: {"type": "text", "chunk": "fresh"}"#]), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut client = client_for(&server);
        let (slow_events, on_slow) = recorder();
        let (fast_events, on_fast) = recorder();

        let slow = client.send("slow", on_slow);
        let fast = client.send("fast", on_fast);

        assert!(slow.is_cancelled());
        assert_eq!(fast.wait().await, StreamStatus::Done);
        assert_eq!(slow.wait().await, StreamStatus::Cancelled);

        // Give the delayed response time to arrive
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(slow_events.lock().unwrap().is_empty());
        assert_eq!(fast_events.lock().unwrap().len(), 2);
        assert_eq!(client.status(), StreamStatus::Done);
    }

    #[tokio::test]
    async fn test_explicit_cancel_is_silent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&["data: [DONE]"]), "text/event-stream")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let mut client = client_for(&server);
        let (events, on_event) = recorder();
        let handle = client.send("q", on_event);
        client.cancel();

        assert_eq!(handle.wait().await, StreamStatus::Cancelled);
        assert_eq!(client.status(), StreamStatus::Cancelled);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        assert!(client_for(&server).health().await.is_ok());

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&down)
            .await;

        let err = client_for(&down).health().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_from_status_detail() {
        let err = ClientError::from_status(StatusCode::SERVICE_UNAVAILABLE, r#"{"detail": "down"}"#);
        assert_eq!(err.to_string(), "HTTP 503 Service Unavailable: down");

        let err = ClientError::from_status(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.to_string(), "HTTP 502 Bad Gateway: Bad Gateway");
    }
}
