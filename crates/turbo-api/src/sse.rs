//! Server-Sent Events
//!
//! Each event is written in the `text/event-stream` wire format:
//!
//! ```text
//! event: tick
//! id: 7
//! retry: 3000
//! data: line1
//! data: line2
//!
//! ```
//!
//! # Example
//!
//! ```rust
//! use turbo_api::sse::{sse_response, SseEvent};
//!
//! let events = async_stream::stream! {
//!     for i in 0..3 {
//!         yield SseEvent::new(format!("tick {}", i)).with_event("tick").with_id(i.to_string());
//!     }
//! };
//! let response = sse_response(events);
//! assert_eq!(response.header("content-type"), Some("text/event-stream"));
//! ```

use crate::response::{BoxError, Response};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// A single Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub data: String,
    pub event: Option<String>,
    pub id: Option<String>,
    /// Client reconnection delay in milliseconds
    pub retry: Option<u64>,
    /// Comment line, ignored by clients
    pub comment: Option<String>,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Event carrying a JSON payload as its data
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(value.to_string())
    }

    /// A comment-only event, used for keep-alives
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            comment: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(format_sse_event(self))
    }
}

impl fmt::Display for SseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_sse_event(self))
    }
}

/// Render an event, terminated by the blank line that ends it.
///
/// Multi-line data becomes one `data:` line per line of input.
pub fn format_sse_event(event: &SseEvent) -> String {
    let mut output = String::new();

    if let Some(comment) = &event.comment {
        for line in comment.lines() {
            output.push_str(&format!(": {}\n", line));
        }
        if event.data.is_empty() && event.event.is_none() && event.id.is_none() && event.retry.is_none() {
            output.push('\n');
            return output;
        }
    }
    if let Some(event_type) = &event.event {
        output.push_str(&format!("event: {}\n", event_type));
    }
    if let Some(id) = &event.id {
        output.push_str(&format!("id: {}\n", id));
    }
    if let Some(retry) = event.retry {
        output.push_str(&format!("retry: {}\n", retry));
    }
    if event.data.is_empty() {
        output.push_str("data: \n");
    } else {
        for line in event.data.lines() {
            output.push_str(&format!("data: {}\n", line));
        }
    }
    output.push('\n');
    output
}

/// Streaming `text/event-stream` response
///
/// The stream is consumed lazily by the transport and may be indefinite.
pub fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = SseEvent> + Send + 'static,
{
    let body = events.map(|event| {
        trace!(event_type = ?event.event, event_id = ?event.id, "Sending SSE event");
        Ok::<Bytes, BoxError>(event.to_bytes())
    });
    Response::stream(body, "text/event-stream")
        .with_header("cache-control", "no-cache")
        .with_header("connection", "keep-alive")
        .with_header("x-accel-buffering", "no")
}

/// Endless stream of keep-alive comments, one per `interval`
pub fn keep_alive_stream(interval: Duration) -> impl Stream<Item = SseEvent> + Send {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            yield SseEvent::comment("keep-alive");
        }
    }
}
