//! Live process feed.
//!
//! One producer task per client takes a full-screen process snapshot every
//! interval and hands it to the client's stream. Each frame replaces the
//! previous one. Starting a feed for a client stops its previous feed first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessesConfig;

/// A failed snapshot. The display text is sent to the client as the frame.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Command timeout")]
    Timeout,
    #[error("Error: {0}")]
    Failed(String),
}

/// Produces one textual snapshot of system process state.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<String, SnapshotError>;
}

/// Runs a batch-mode `top` (or any configured command) and returns stdout.
pub struct TopSnapshot {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    columns: u16,
    lines: u16,
}

impl TopSnapshot {
    pub fn new(config: &ProcessesConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
            columns: config.columns,
            lines: config.lines,
        }
    }
}

#[async_trait::async_trait]
impl SnapshotSource for TopSnapshot {
    async fn snapshot(&self) -> Result<String, SnapshotError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .env("COLUMNS", self.columns.to_string())
            .env("LINES", self.lines.to_string());
        run_captured(command, self.timeout).await
    }
}

/// Run `command` to completion and return its stdout. A non-zero exit
/// becomes [`SnapshotError::Failed`] carrying stderr.
pub(crate) async fn run_captured(
    mut command: Command,
    timeout: Duration,
) -> Result<String, SnapshotError> {
    let output = command.kill_on_drop(true).output();

    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| SnapshotError::Timeout)?
        .map_err(|e| SnapshotError::Failed(e.to_string()))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SnapshotError::Failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Why a feed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FeedEnd {
    /// The same client started a newer feed.
    Superseded,
    /// The server is stopping.
    Shutdown,
    /// The producer stopped on its own.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Frame(String),
    End(FeedEnd),
}

struct ActiveFeed {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type FeedTable = Mutex<HashMap<String, ActiveFeed>>;

fn lock_feeds(feeds: &FeedTable) -> MutexGuard<'_, HashMap<String, ActiveFeed>> {
    feeds.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks at most one running feed per client key.
pub struct FeedHub {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    feeds: Arc<FeedTable>,
    next_id: AtomicU64,
    shutting_down: Arc<AtomicBool>,
}

impl FeedHub {
    pub fn new(source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            feeds: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the client's current feed, wait for its producer to finish, then
    /// start a new one.
    pub async fn start(&self, client_key: &str) -> FeedStream {
        let previous = lock_feeds(&self.feeds).remove(client_key);
        if let Some(previous) = previous {
            stop_feed(client_key, previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_feed(
            Arc::clone(&self.source),
            self.interval,
            frame_tx,
            cancel.clone(),
        ));

        // A concurrent start for the same key may have slipped in.
        let raced = lock_feeds(&self.feeds).insert(
            client_key.to_string(),
            ActiveFeed {
                id,
                cancel: cancel.clone(),
                task,
            },
        );
        if let Some(raced) = raced {
            stop_feed(client_key, raced).await;
        }
        log::info!("Process feed {id} started for {client_key}");

        FeedStream {
            id,
            client_key: client_key.to_string(),
            frames: frame_rx,
            cancel,
            feeds: Arc::downgrade(&self.feeds),
            shutting_down: Arc::clone(&self.shutting_down),
            finished: false,
        }
    }

    /// Number of feeds currently running.
    pub fn active(&self) -> usize {
        lock_feeds(&self.feeds).len()
    }

    /// End every feed with a `shutdown` frame.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for (_, feed) in lock_feeds(&self.feeds).drain() {
            feed.cancel.cancel();
        }
    }
}

async fn stop_feed(client_key: &str, feed: ActiveFeed) {
    feed.cancel.cancel();
    if let Err(err) = feed.task.await {
        log::warn!("Process feed {} for {client_key} failed: {err}", feed.id);
    }
    log::info!("Process feed {} stopped for {client_key}", feed.id);
}

async fn run_feed(
    source: Arc<dyn SnapshotSource>,
    period: Duration,
    frames: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = source.snapshot() => match result {
                Ok(text) => text,
                Err(err) => err.to_string(),
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = frames.send(frame) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Consumer side of one feed.
pub struct FeedStream {
    id: u64,
    client_key: String,
    frames: mpsc::Receiver<String>,
    cancel: CancellationToken,
    feeds: Weak<FeedTable>,
    shutting_down: Arc<AtomicBool>,
    finished: bool,
}

impl FeedStream {
    /// Next frame, then a single `End`, then `None`.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        if self.finished {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                if self.shutting_down.load(Ordering::SeqCst) {
                    FeedEvent::End(FeedEnd::Shutdown)
                } else {
                    FeedEvent::End(FeedEnd::Superseded)
                }
            }
            frame = self.frames.recv() => match frame {
                Some(frame) => FeedEvent::Frame(frame),
                None => FeedEvent::End(FeedEnd::Stopped),
            },
        };

        if matches!(event, FeedEvent::End(_)) {
            self.finished = true;
        }
        Some(event)
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(feeds) = self.feeds.upgrade() {
            let mut feeds = lock_feeds(&feeds);
            if feeds.get(&self.client_key).is_some_and(|f| f.id == self.id) {
                feeds.remove(&self.client_key);
            }
        }
    }
}
