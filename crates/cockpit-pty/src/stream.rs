//! Output streamer: the ordered push channel behind `GET /terminal/read`.
//!
//! Output chunks travel through a bounded channel filled by the session's
//! PTY reader thread. Ends that originate outside the reader (disconnect,
//! delete, supersede) arrive on a separate oneshot so they are not stuck
//! behind a full buffer.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::TerminalId;

/// One unit delivered to a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Raw PTY output. Not aligned to lines or UTF-8 boundaries.
    Output(Vec<u8>),
    /// Final event of a stream.
    End(EndReason),
}

/// Why a binding's stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// The client called disconnect.
    Detached,
    /// The session was deleted or the host is shutting down.
    SessionClosed,
    /// The backing shell exited on its own.
    ProcessExited { code: Option<u32> },
    /// Another binding attached to the same session.
    Superseded,
    /// The consumer went away.
    TransportClosed,
    /// Reading from the PTY failed.
    Error { message: String },
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::SessionClosed => "session_closed",
            Self::ProcessExited { .. } => "process_exited",
            Self::Superseded => "superseded",
            Self::TransportClosed => "transport_closed",
            Self::Error { .. } => "error",
        }
    }

    /// Whether a binding ended for this reason before anyone opened its
    /// stream still hands the stream out to a later `read`.
    pub(crate) fn reaches_late_reader(&self) -> bool {
        !matches!(self, Self::Detached | Self::TransportClosed)
    }
}

/// Receiving side of a binding, handed out once by `TerminalBridge::read`.
pub struct OutputStream {
    terminal_id: TerminalId,
    output_rx: mpsc::Receiver<StreamEvent>,
    end_rx: Option<oneshot::Receiver<EndReason>>,
    /// End to report once the output channel is drained and closed.
    tail: Option<EndReason>,
    finished: bool,
    release: Option<Box<dyn FnOnce() + Send>>,
}

/// Channel halves created at connect time; the senders go to the session,
/// the receivers wait here until the client opens its stream.
pub(crate) struct PendingStream {
    pub output_rx: mpsc::Receiver<StreamEvent>,
    pub end_rx: oneshot::Receiver<EndReason>,
    /// Set when the binding ended in-band before its stream was claimed.
    pub tail: Option<EndReason>,
}

enum Next {
    End(Option<EndReason>),
    Output(Option<StreamEvent>),
}

impl OutputStream {
    pub(crate) fn new(
        terminal_id: TerminalId,
        pending: PendingStream,
        release: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            terminal_id,
            output_rx: pending.output_rx,
            end_rx: Some(pending.end_rx),
            tail: pending.tail,
            finished: false,
            release: Some(release),
        }
    }

    pub fn terminal_id(&self) -> TerminalId {
        self.terminal_id
    }

    /// Wait for the next event. Yields exactly one `End` and then `None`.
    ///
    /// Cancel-safe: dropping the future between events loses nothing.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            if self.finished {
                return None;
            }

            let next = match self.end_rx.as_mut() {
                Some(end_rx) => tokio::select! {
                    biased;
                    reason = end_rx => Next::End(reason.ok()),
                    event = self.output_rx.recv() => Next::Output(event),
                },
                None => Next::Output(self.output_rx.recv().await),
            };

            let event = match next {
                Next::End(Some(reason)) => StreamEvent::End(reason),
                // The end sender was dropped without a reason. That happens
                // after an in-band end, which is still queued in output_rx.
                Next::End(None) => {
                    self.end_rx = None;
                    continue;
                }
                Next::Output(Some(event)) => event,
                Next::Output(None) => match self.tail.take() {
                    Some(reason) => StreamEvent::End(reason),
                    None => StreamEvent::End(EndReason::Error {
                        message: "output channel closed".to_string(),
                    }),
                },
            };

            if matches!(event, StreamEvent::End(_)) {
                self.finished = true;
            }
            return Some(event);
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Decodes arbitrary byte chunks into UTF-8 text without splitting
/// multibyte characters across frames.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + bytes` as possible. An incomplete trailing
    /// sequence is kept for the next call; invalid bytes become U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[start..valid_end]) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush whatever is left, replacing an incomplete sequence with U+FFFD.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn stream_with(
        capacity: usize,
    ) -> (
        OutputStream,
        mpsc::Sender<StreamEvent>,
        oneshot::Sender<EndReason>,
        Arc<AtomicBool>,
    ) {
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (end_tx, end_rx) = oneshot::channel();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let stream = OutputStream::new(
            TerminalId::new(),
            PendingStream {
                output_rx,
                end_rx,
                tail: None,
            },
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        (stream, output_tx, end_tx, released)
    }

    #[tokio::test]
    async fn test_in_band_end_follows_output() {
        let (mut stream, output_tx, end_tx, _) = stream_with(8);
        output_tx.send(StreamEvent::Output(b"one".to_vec())).await.unwrap();
        output_tx.send(StreamEvent::Output(b"two".to_vec())).await.unwrap();
        output_tx
            .send(StreamEvent::End(EndReason::ProcessExited { code: Some(0) }))
            .await
            .unwrap();
        drop(output_tx);
        drop(end_tx);

        assert_eq!(stream.recv().await, Some(StreamEvent::Output(b"one".to_vec())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Output(b"two".to_vec())));
        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::End(EndReason::ProcessExited { code: Some(0) }))
        );
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_out_of_band_end_wins_over_full_buffer() {
        let (mut stream, output_tx, end_tx, _) = stream_with(1);
        output_tx.send(StreamEvent::Output(b"queued".to_vec())).await.unwrap();
        end_tx.send(EndReason::SessionClosed).unwrap();

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::End(EndReason::SessionClosed))
        );
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_with_error() {
        let (mut stream, output_tx, end_tx, _) = stream_with(1);
        drop(output_tx);
        drop(end_tx);

        match stream.recv().await {
            Some(StreamEvent::End(EndReason::Error { .. })) => {}
            other => panic!("expected error end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tail_end_after_drained_output() {
        let (output_tx, output_rx) = mpsc::channel(4);
        let (end_tx, end_rx) = oneshot::channel();
        output_tx.send(StreamEvent::Output(b"last words".to_vec())).await.unwrap();
        drop(output_tx);
        drop(end_tx);

        let mut stream = OutputStream::new(
            TerminalId::new(),
            PendingStream {
                output_rx,
                end_rx,
                tail: Some(EndReason::ProcessExited { code: Some(0) }),
            },
            Box::new(|| {}),
        );

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Output(b"last words".to_vec()))
        );
        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::End(EndReason::ProcessExited { code: Some(0) }))
        );
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_runs_release() {
        let (stream, _output_tx, _end_tx, released) = stream_with(1);
        assert!(!released.load(Ordering::SeqCst));
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_end_reason_serialization() {
        let json = serde_json::to_value(EndReason::ProcessExited { code: Some(2) }).unwrap();
        assert_eq!(json["reason"], "process_exited");
        assert_eq!(json["code"], 2);

        let json = serde_json::to_value(EndReason::Superseded).unwrap();
        assert_eq!(json["reason"], EndReason::Superseded.as_str());
        assert!(EndReason::SessionClosed.reaches_late_reader());
        assert!(!EndReason::Detached.reaches_late_reader());
        assert!(!EndReason::TransportClosed.reaches_late_reader());
    }

    #[test]
    fn test_utf8_chunker_carries_split_sequence() {
        let bytes = "héllo ✓".as_bytes();
        let mut chunker = Utf8Chunker::new();
        let mut text = String::new();
        for byte in bytes {
            text.push_str(&chunker.push(std::slice::from_ref(byte)));
        }
        text.push_str(&chunker.finish());
        assert_eq!(text, "héllo ✓");
    }

    #[test]
    fn test_utf8_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.push(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(chunker.push(b"\xe2\x9c"), "");
        assert_eq!(chunker.finish(), "\u{FFFD}");
    }
}
