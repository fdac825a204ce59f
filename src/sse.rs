//! Server-Sent Events (SSE) stream processing utilities.
//!
//! The query endpoint answers with a body of newline-delimited records:
//! ```text
//! data: {"type": "graph", "nodes": [...], "edges": [...]}
//!
//! data: {"type": "text", "chunk": "Graph"}
//!
//! event: end
//! data: [DONE]
//! ```
//!
//! Network chunks do not respect line (or even character) boundaries, so
//! decoding goes through a [`LineDecoder`] that keeps an incomplete UTF-8
//! sequence and an incomplete line between reads.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::client::ClientError;

/// Prefix of every record the client cares about.
const DATA_PREFIX: &str = "data: ";

/// Literal payload that terminates the stream.
const DONE_MARKER: &str = "[DONE]";

/// Incremental bytes-to-lines decoder.
///
/// Holds at most one partial line and at most one incomplete UTF-8 sequence.
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Tail of the last chunk that ends in the middle of a character.
    pending_bytes: Vec<u8>,
    /// Decoded text after the last line terminator.
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and return every line it completed, in order.
    ///
    /// Line terminators (`\n` or `\r\n`) are stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode(chunk);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete.lines().map(str::to_string).collect()
    }

    /// Flush at end of stream, returning the unterminated last line if any.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending_bytes.is_empty() {
            let tail = std::mem::take(&mut self.pending_bytes);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }

        let line = std::mem::take(&mut self.buffer);
        let line = line.trim_end_matches(['\r', '\n']);
        (!line.is_empty()).then(|| line.to_string())
    }

    /// Buffered text that is not yet a complete line.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn decode(&mut self, chunk: &[u8]) {
        let mut input = std::mem::take(&mut self.pending_bytes);
        input.extend_from_slice(chunk);

        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer.push_str(&String::from_utf8_lossy(&rest[..valid]));

                    match e.error_len() {
                        // Invalid sequence: substitute and keep going.
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        // Sequence cut off by the chunk boundary.
                        None => {
                            self.pending_bytes = rest[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Extension trait for `reqwest::Response` to enable SSE streaming.
///
/// # Example
/// ```ignore
/// use paperchat::sse::SSEResponseExt;
///
/// let response = http.post(url).json(&body).send().await?;
///
/// let mut stream = response.sse();
/// while let Some(result) = stream.next().await {
///     let payload = result?;
///     println!("SSE data: {}", payload);
/// }
/// ```
pub trait SSEResponseExt {
    /// Convert the response into a stream of raw SSE data payloads.
    ///
    /// Returns the content after the `data: ` prefix for each record.
    /// Stops when the `[DONE]` marker is encountered or the body ends.
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send {
        sse_data(self.bytes_stream().map(|chunk| chunk.map_err(ClientError::body)))
    }
}

/// Turn any byte stream into a stream of SSE data payloads.
///
/// Lines without the `data: ` prefix are skipped. Nothing is yielded after
/// the `[DONE]` marker, even if more lines arrived in the same chunk. When
/// the body closes without a marker the trailing partial line is still
/// processed. A read error is yielded once and ends the stream.
pub fn sse_data<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, ClientError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<ClientError> + Send,
{
    stream::unfold(
        (
            Box::pin(byte_stream),
            LineDecoder::new(),
            VecDeque::<String>::new(),
            false,
        ),
        |(mut byte_stream, mut decoder, mut ready, mut stream_ended)| async move {
            loop {
                // Drain lines that are already complete
                while let Some(line) = ready.pop_front() {
                    let Some(data) = parse_sse_line(&line) else {
                        continue;
                    };

                    if is_done_marker(data) {
                        return None;
                    }

                    let data = data.to_string();
                    return Some((Ok(data), (byte_stream, decoder, ready, stream_ended)));
                }

                if stream_ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        stream_ended = true;
                        return Some((Err(e.into()), (byte_stream, decoder, ready, stream_ended)));
                    }
                    None => {
                        // Body closed without a marker: flush what is left
                        stream_ended = true;
                        ready.extend(decoder.finish());
                    }
                }
            }
        },
    )
}

/// Parse an SSE line to extract the data portion.
///
/// SSE lines are in the format: `data: <content>`
///
/// # Example
/// ```
/// use paperchat::sse::parse_sse_line;
///
/// let line = "data: {\"key\": \"value\"}";
/// assert_eq!(parse_sse_line(line), Some("{\"key\": \"value\"}"));
///
/// let line = "event: end";
/// assert_eq!(parse_sse_line(line), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.trim().strip_prefix(DATA_PREFIX).map(|s| s.trim())
}

/// Check if an SSE data payload is the termination sentinel.
///
/// # Example
/// ```
/// use paperchat::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(!is_done_marker(""));
/// assert!(!is_done_marker("{\"type\": \"text\"}"));
/// ```
pub fn is_done_marker(data: &str) -> bool {
    data == DONE_MARKER
}
