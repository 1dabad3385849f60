use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use portable_pty::ChildKiller;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::TerminalId;
use crate::error::{Error, Result};
use crate::io_thread::{start_input_thread, start_output_thread, InputCommand};
use crate::pty::{PtyError, PtyHandle, PtyParts, ShellCommand};
use crate::stream::{EndReason, PendingStream, StreamEvent};

/// How new sessions are spawned.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: ShellCommand,
    pub rows: u16,
    pub cols: u16,
    /// Queued write/resize commands per session before callers wait.
    pub input_buffer: usize,
    /// Size of each PTY read, and so the upper bound of one output chunk.
    pub read_chunk_size: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            command: ShellCommand::default(),
            rows: 24,
            cols: 80,
            input_buffer: 256,
            read_chunk_size: 4096,
        }
    }
}

/// Public view of a session, as returned by listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub index: usize,
    pub created_at: DateTime<Utc>,
    pub last_attached_at: Option<DateTime<Utc>>,
    pub attached: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
}

/// The one binding currently streaming from a session.
struct Attachment {
    terminal_id: TerminalId,
    output_tx: mpsc::Sender<StreamEvent>,
    end_tx: Option<oneshot::Sender<EndReason>>,
    /// Receivers not yet claimed by a `read` call.
    pending: Option<PendingStream>,
}

/// Ended bindings whose stream was never opened, kept per session.
const MAX_UNREAD: usize = 4;

impl Attachment {
    /// End the binding out of band. Returns its stream if nobody claimed it
    /// yet and the reason is one a late reader should still see.
    fn end(mut self, reason: EndReason) -> Option<PendingStream> {
        let keep = reason.reaches_late_reader();
        if let Some(end_tx) = self.end_tx.take() {
            let _ = end_tx.send(reason);
        }
        self.pending.take().filter(|_| keep)
    }
}

struct SessionState {
    attachment: Option<Attachment>,
    /// Cleared by the output thread once the shell is gone.
    alive: bool,
    /// Set by `close`; the session no longer accepts attaches.
    closed: bool,
    last_attached_at: Option<DateTime<Utc>>,
    rows: u16,
    cols: u16,
    /// Streams of ended bindings, waiting for their first `read`.
    unread: VecDeque<(TerminalId, PendingStream)>,
}

impl SessionState {
    fn keep_unread(&mut self, terminal_id: TerminalId, pending: Option<PendingStream>) {
        if let Some(pending) = pending {
            if self.unread.len() >= MAX_UNREAD {
                self.unread.pop_front();
            }
            self.unread.push_back((terminal_id, pending));
        }
    }

    /// End the current binding, if any, and return its id.
    fn end_attachment(&mut self, reason: EndReason) -> Option<TerminalId> {
        let attachment = self.attachment.take()?;
        let terminal_id = attachment.terminal_id;
        let pending = attachment.end(reason);
        self.keep_unread(terminal_id, pending);
        Some(terminal_id)
    }
}

/// A durable named shell process.
///
/// A session outlives every binding attached to it. Output produced while
/// nothing is attached is discarded.
pub struct Session {
    name: String,
    owner: String,
    index: usize,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    state: Mutex<SessionState>,
    input_tx: Mutex<Option<mpsc::Sender<InputCommand>>>,
    /// Keeps recorded geometry and queued resizes in the same order.
    resize_lock: tokio::sync::Mutex<()>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl Session {
    /// Spawn the backing process and its two I/O threads.
    pub(crate) fn spawn(
        name: String,
        owner: String,
        index: usize,
        options: &SpawnOptions,
    ) -> std::result::Result<Arc<Self>, PtyError> {
        let handle = PtyHandle::spawn(&options.command, options.rows, options.cols)?;
        let pid = handle.process_id();
        let PtyParts {
            master,
            reader,
            writer,
            child,
        } = handle.into_parts();
        let killer = child.clone_killer();
        let (input_tx, input_rx) = mpsc::channel(options.input_buffer.max(1));

        let session = Arc::new(Self {
            name,
            owner,
            index,
            created_at: Utc::now(),
            pid,
            state: Mutex::new(SessionState {
                attachment: None,
                alive: true,
                closed: false,
                last_attached_at: None,
                rows: options.rows,
                cols: options.cols,
                unread: VecDeque::new(),
            }),
            input_tx: Mutex::new(Some(input_tx)),
            resize_lock: tokio::sync::Mutex::new(()),
            killer: Mutex::new(killer),
        });

        let started = start_input_thread(&session.name, master, writer, input_rx).and_then(|()| {
            start_output_thread(
                Arc::clone(&session),
                reader,
                child,
                options.read_chunk_size.max(1),
            )
        });
        if let Err(err) = started {
            session.close(EndReason::SessionClosed);
            return Err(err.into());
        }

        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// `false` once the shell exited or the session was closed.
    pub fn is_alive(&self) -> bool {
        let state = self.state();
        state.alive && !state.closed
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            name: self.name.clone(),
            index: self.index,
            created_at: self.created_at,
            last_attached_at: state.last_attached_at,
            attached: state.attachment.is_some(),
            pid: self.pid,
            rows: state.rows,
            cols: state.cols,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `terminal_id` to this session, superseding any previous binding.
    pub(crate) fn attach(&self, terminal_id: TerminalId, buffer: usize) -> Result<()> {
        let (output_tx, output_rx) = mpsc::channel(buffer.max(1));
        let (end_tx, end_rx) = oneshot::channel();

        let previous = {
            let mut state = self.state();
            if !state.alive || state.closed {
                return Err(Error::SessionNotFound(self.name.clone()));
            }
            state.last_attached_at = Some(Utc::now());
            let previous = state.end_attachment(EndReason::Superseded);
            state.attachment = Some(Attachment {
                terminal_id,
                output_tx,
                end_tx: Some(end_tx),
                pending: Some(PendingStream {
                    output_rx,
                    end_rx,
                    tail: None,
                }),
            });
            previous
        };

        if let Some(previous) = previous {
            log::info!(
                "Terminal {previous} superseded by {terminal_id} on session {}",
                self.name
            );
        }
        Ok(())
    }

    pub(crate) fn is_bound_to(&self, terminal_id: TerminalId) -> bool {
        self.state()
            .attachment
            .as_ref()
            .is_some_and(|a| a.terminal_id == terminal_id)
    }

    /// `true` while `terminal_id` is current or ended with an unopened stream.
    pub(crate) fn has_stream(&self, terminal_id: TerminalId) -> bool {
        let state = self.state();
        state
            .attachment
            .as_ref()
            .is_some_and(|a| a.terminal_id == terminal_id)
            || state.unread.iter().any(|(id, _)| *id == terminal_id)
    }

    /// Hand out the stream receivers of a binding, once.
    ///
    /// A binding that already ended still hands out its buffered output
    /// followed by the end.
    pub(crate) fn take_stream(&self, terminal_id: TerminalId) -> Result<PendingStream> {
        let mut state = self.state();
        if let Some(attachment) = state
            .attachment
            .as_mut()
            .filter(|a| a.terminal_id == terminal_id)
        {
            return attachment
                .pending
                .take()
                .ok_or(Error::StreamBusy(terminal_id));
        }

        let position = state
            .unread
            .iter()
            .position(|(id, _)| *id == terminal_id)
            .ok_or(Error::TerminalNotFound(terminal_id))?;
        state
            .unread
            .remove(position)
            .map(|(_, pending)| pending)
            .ok_or(Error::TerminalNotFound(terminal_id))
    }

    /// Release `terminal_id` if it is still the current binding.
    ///
    /// An ended binding whose stream was never opened is dropped as well.
    ///
    /// Returns `true` if a binding was released.
    pub(crate) fn detach(&self, terminal_id: TerminalId, reason: EndReason) -> bool {
        let label = reason.as_str();
        let released = {
            let mut state = self.state();
            let current = state
                .attachment
                .as_ref()
                .is_some_and(|a| a.terminal_id == terminal_id);
            if current {
                state.end_attachment(reason).is_some()
            } else {
                state.unread.retain(|(id, _)| *id != terminal_id);
                false
            }
        };

        if released {
            log::info!(
                "Terminal {terminal_id} detached from session {} ({label})",
                self.name
            );
        }
        released
    }

    /// Queue input bytes from the binding `terminal_id`.
    pub(crate) async fn write(&self, terminal_id: TerminalId, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            self.input_sender(terminal_id)?;
            return Ok(());
        }
        self.send_input(terminal_id, InputCommand::Data(data)).await
    }

    /// Queue a resize. Unchanged geometry is a no-op.
    pub(crate) async fn resize(&self, terminal_id: TerminalId, rows: u16, cols: u16) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidGeometry { rows, cols });
        }

        let _serial = self.resize_lock.lock().await;
        let input_tx = self.input_sender(terminal_id)?;
        {
            let mut state = self.state();
            if state.rows == rows && state.cols == cols {
                return Ok(());
            }
            state.rows = rows;
            state.cols = cols;
        }

        input_tx
            .send(InputCommand::Resize { rows, cols })
            .await
            .map_err(|_| Error::Closed(self.name.clone()))
    }

    async fn send_input(&self, terminal_id: TerminalId, command: InputCommand) -> Result<()> {
        let input_tx = self.input_sender(terminal_id)?;
        input_tx
            .send(command)
            .await
            .map_err(|_| Error::Closed(self.name.clone()))
    }

    fn input_sender(&self, terminal_id: TerminalId) -> Result<mpsc::Sender<InputCommand>> {
        if !self.is_bound_to(terminal_id) {
            return Err(Error::TerminalNotFound(terminal_id));
        }
        self.input_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::Closed(self.name.clone()))
    }

    /// Terminate the backing process and end any attached stream.
    pub(crate) fn close(&self, reason: EndReason) {
        {
            let mut state = self.state();
            state.closed = true;
            state.end_attachment(reason);
        }

        // Dropping the sender stops the input thread once in-flight writes land.
        self.input_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = killer.kill() {
            log::debug!("Kill of session {} failed: {err}", self.name);
        }
    }

    /// Deliver one output chunk to the current binding, if any.
    ///
    /// Called from the output thread. Blocks while the binding's buffer is
    /// full; never holds the state lock while blocked.
    pub(crate) fn route_output(&self, chunk: Vec<u8>) {
        let target = {
            let state = self.state();
            state
                .attachment
                .as_ref()
                .map(|a| (a.terminal_id, a.output_tx.clone()))
        };

        let Some((terminal_id, output_tx)) = target else {
            log::trace!("Session {}: dropped {} bytes, no binding", self.name, chunk.len());
            return;
        };

        if output_tx.blocking_send(StreamEvent::Output(chunk)).is_err() {
            self.detach(terminal_id, EndReason::TransportClosed);
        }
    }

    /// Called once by the output thread when the PTY is drained.
    ///
    /// A consumer already reading gets the end after its output. An unopened
    /// stream keeps its buffered output and reports the end once drained.
    pub(crate) fn finish_output(&self, reason: EndReason) {
        let attachment = {
            let mut state = self.state();
            state.alive = false;
            if state.closed {
                return;
            }
            let Some(mut attachment) = state.attachment.take() else {
                return;
            };

            if let Some(mut pending) = attachment.pending.take() {
                let terminal_id = attachment.terminal_id;
                log::info!(
                    "Session {} ended ({}), terminal {terminal_id} not yet read",
                    self.name,
                    reason.as_str()
                );
                pending.tail = Some(reason);
                // Closes the output channel behind the buffered chunks.
                drop(attachment);
                state.keep_unread(terminal_id, Some(pending));
                return;
            }
            attachment
        };

        log::info!(
            "Session {} ended ({}), closing terminal {}",
            self.name,
            reason.as_str(),
            attachment.terminal_id
        );
        let _ = attachment
            .output_tx
            .blocking_send(StreamEvent::End(reason));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn options(command: ShellCommand) -> SpawnOptions {
        SpawnOptions {
            command,
            ..SpawnOptions::default()
        }
    }

    fn sh_session(name: &str) -> Arc<Session> {
        Session::spawn(
            name.to_string(),
            "tester".to_string(),
            0,
            &options(ShellCommand::new("/bin/sh", &[])),
        )
        .unwrap()
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn test_spawned_session_is_alive() {
        let session = sh_session("alive");
        assert!(session.is_alive());
        let info = session.info();
        assert_eq!(info.name, "alive");
        assert!(!info.attached);
        assert_eq!((info.rows, info.cols), (24, 80));
        session.close(EndReason::SessionClosed);
        assert!(!session.is_alive());
    }

    #[test]
    fn test_attach_rejected_after_close() {
        let session = sh_session("closed");
        session.close(EndReason::SessionClosed);
        let err = session.attach(TerminalId::new(), 8).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[test]
    fn test_take_stream_once() {
        let session = sh_session("once");
        let id = TerminalId::new();
        session.attach(id, 8).unwrap();

        assert!(session.take_stream(id).is_ok());
        assert!(matches!(session.take_stream(id), Err(Error::StreamBusy(_))));
        assert!(matches!(
            session.take_stream(TerminalId::new()),
            Err(Error::TerminalNotFound(_))
        ));
        session.close(EndReason::SessionClosed);
    }

    #[test]
    fn test_detach_only_matching_binding() {
        let session = sh_session("detach");
        let id = TerminalId::new();
        session.attach(id, 8).unwrap();

        assert!(!session.detach(TerminalId::new(), EndReason::Detached));
        assert!(session.is_bound_to(id));
        assert!(session.detach(id, EndReason::Detached));
        assert!(!session.is_bound_to(id));
        assert!(session.is_alive());
        session.close(EndReason::SessionClosed);
    }

    #[tokio::test]
    async fn test_resize_rules() {
        let session = sh_session("resize");
        let id = TerminalId::new();
        session.attach(id, 8).unwrap();

        assert!(matches!(
            session.resize(id, 0, 80).await,
            Err(Error::InvalidGeometry { rows: 0, cols: 80 })
        ));
        session.resize(id, 24, 80).await.unwrap();
        session.resize(id, 40, 120).await.unwrap();
        session.resize(id, 40, 120).await.unwrap();
        assert_eq!((session.info().rows, session.info().cols), (40, 120));
        session.close(EndReason::SessionClosed);
    }

    #[test]
    fn test_shell_exit_marks_session_dead() {
        let session = Session::spawn(
            "short".to_string(),
            "tester".to_string(),
            0,
            &options(ShellCommand::new("/bin/sh", &["-c", "exit 0"])),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || !session.is_alive()));
    }
}
