//! SSE framing for terminal output and process feeds.
//!
//! Terminal frames carry `{"output": "<text>"}`; the last frame of every
//! stream is an `end` event naming the reason. Feed frames carry the raw
//! snapshot text.
//!
//! Every stream opens with a `retry:` hint. The `end` event carries the id
//! `end`, so a browser that reconnects after it presents
//! `Last-Event-ID: end` and is answered 204, which stops `EventSource`
//! from retrying.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::response::sse::Event;
use cockpit_pty::{EndReason, OutputStream, StreamEvent, Utf8Chunker};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;

use crate::process_feed::{FeedEvent, FeedStream};

pub const END_EVENT: &str = "end";
pub const END_EVENT_ID: &str = "end";

const LAST_EVENT_ID: &str = "last-event-id";

pub fn output_event(text: &str) -> Event {
    Event::default().data(json!({ "output": text }).to_string())
}

pub fn end_event<T: Serialize>(reason: &T) -> Event {
    let data = serde_json::to_string(reason).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(END_EVENT).id(END_EVENT_ID).data(data)
}

pub fn retry_event(retry: Duration) -> Event {
    Event::default().retry(retry)
}

/// True when the client is reconnecting to a stream that already ended.
pub fn already_ended(headers: &HeaderMap) -> bool {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|id| id.trim() == END_EVENT_ID)
}

fn with_retry<S>(
    retry: Duration,
    events: S,
) -> impl Stream<Item = Result<Event, Infallible>> + Send
where
    S: Stream<Item = Result<Event, Infallible>> + Send,
{
    stream::once(async move { Ok(retry_event(retry)) }).chain(events)
}

/// SSE data lines cannot carry bare carriage returns.
pub fn snapshot_event(text: &str) -> Event {
    Event::default().data(text.replace('\r', ""))
}

struct TerminalFrames {
    stream: OutputStream,
    chunker: Utf8Chunker,
    queued_end: Option<EndReason>,
    done: bool,
}

impl TerminalFrames {
    async fn next_event(&mut self) -> Option<Event> {
        if let Some(reason) = self.queued_end.take() {
            self.done = true;
            return Some(end_event(&reason));
        }
        if self.done {
            return None;
        }

        loop {
            match self.stream.recv().await? {
                StreamEvent::Output(bytes) => {
                    let text = self.chunker.push(&bytes);
                    if !text.is_empty() {
                        return Some(output_event(&text));
                    }
                }
                StreamEvent::End(reason) => {
                    log::info!(
                        "Terminal {} stream ended: {}",
                        self.stream.terminal_id(),
                        reason.as_str()
                    );
                    let tail = self.chunker.finish();
                    if tail.is_empty() {
                        self.done = true;
                        return Some(end_event(&reason));
                    }
                    self.queued_end = Some(reason);
                    return Some(output_event(&tail));
                }
            }
        }
    }
}

/// Frame a binding's output stream. Dropping the returned stream drops the
/// [`OutputStream`], which releases the binding.
pub fn terminal_events(
    stream: OutputStream,
    retry: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let frames = TerminalFrames {
        stream,
        chunker: Utf8Chunker::new(),
        queued_end: None,
        done: false,
    };
    let events = stream::unfold(frames, |mut frames| async move {
        let event = frames.next_event().await?;
        Some((Ok(event), frames))
    });
    with_retry(retry, events)
}

/// Frame a process feed: one event per snapshot, then `end`.
pub fn feed_events(
    feed: FeedStream,
    retry: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let events = stream::unfold(feed, |mut feed| async move {
        let event = match feed.recv().await? {
            FeedEvent::Frame(text) => snapshot_event(&text),
            FeedEvent::End(reason) => end_event(&reason),
        };
        Some((Ok(event), feed))
    });
    with_retry(retry, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_already_ended() {
        let mut headers = HeaderMap::new();
        assert!(!already_ended(&headers));

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("3"));
        assert!(!already_ended(&headers));

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static(END_EVENT_ID));
        assert!(already_ended(&headers));
    }
}
