//! Terminal bridge: bindings between clients and sessions.
//!
//! A binding is created by `connect`, identified by a fresh [`TerminalId`],
//! and routes `write`/`resize`/`read` to its session. The session decides
//! whether an id is still current; the table here only remembers which
//! session and owner an id was issued for.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::stream::{EndReason, OutputStream};

/// Opaque identifier of one binding. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(Uuid);

impl TerminalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TerminalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TerminalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

struct Binding {
    session: Arc<Session>,
    owner: String,
}

type BindingTable = Mutex<HashMap<TerminalId, Binding>>;

#[derive(Debug, Clone, Copy)]
enum Access {
    Input,
    Stream,
}

/// Routes client calls to sessions by terminal id.
pub struct TerminalBridge {
    registry: Arc<SessionRegistry>,
    bindings: Arc<BindingTable>,
    /// Output chunks buffered per binding before the PTY reader blocks.
    stream_buffer: usize,
}

impl TerminalBridge {
    pub fn new(registry: Arc<SessionRegistry>, stream_buffer: usize) -> Self {
        Self {
            registry,
            bindings: Arc::new(Mutex::new(HashMap::new())),
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TerminalId, Binding>> {
        lock_table(&self.bindings)
    }

    /// Attach a new binding to `session_name`, superseding any previous one.
    ///
    /// `size` is applied as the initial geometry when given.
    pub async fn connect(
        &self,
        owner: &str,
        session_name: &str,
        size: Option<(u16, u16)>,
    ) -> Result<TerminalId> {
        let terminal_id = TerminalId::new();
        let session = self
            .registry
            .attach(owner, session_name, terminal_id, self.stream_buffer)?;

        {
            let mut table = self.table();
            table.retain(|id, binding| binding.session.has_stream(*id));
            table.insert(
                terminal_id,
                Binding {
                    session: Arc::clone(&session),
                    owner: owner.to_string(),
                },
            );
        }
        log::info!("Terminal {terminal_id} connected to session {session_name}");

        if let Some((rows, cols)) = size {
            if let Err(err) = session.resize(terminal_id, rows, cols).await {
                log::warn!("Terminal {terminal_id}: initial resize ignored: {err}");
            }
        }
        Ok(terminal_id)
    }

    /// Resolve a binding for input (still current) or for its stream
    /// (current, or ended with an unopened stream).
    fn session_for(
        &self,
        owner: &str,
        terminal_id: TerminalId,
        access: Access,
    ) -> Result<Arc<Session>> {
        let mut table = self.table();
        // Another owner's binding is indistinguishable from a missing one.
        let session = match table.get(&terminal_id) {
            Some(binding) if binding.owner == owner => Arc::clone(&binding.session),
            _ => return Err(Error::TerminalNotFound(terminal_id)),
        };

        let usable = match access {
            Access::Input => session.is_bound_to(terminal_id),
            Access::Stream => session.has_stream(terminal_id),
        };
        if usable {
            return Ok(session);
        }
        if !session.has_stream(terminal_id) {
            table.remove(&terminal_id);
        }
        Err(Error::TerminalNotFound(terminal_id))
    }

    /// Forward input bytes verbatim. Acknowledges receipt, not delivery.
    pub async fn write(&self, owner: &str, terminal_id: TerminalId, data: Vec<u8>) -> Result<()> {
        let session = self.session_for(owner, terminal_id, Access::Input)?;
        log::trace!("Terminal {terminal_id}: {} input bytes", data.len());
        session.write(terminal_id, data).await
    }

    /// Change the terminal geometry. Unchanged geometry is a no-op.
    pub async fn resize(
        &self,
        owner: &str,
        terminal_id: TerminalId,
        rows: u16,
        cols: u16,
    ) -> Result<()> {
        let session = self.session_for(owner, terminal_id, Access::Input)?;
        session.resize(terminal_id, rows, cols).await
    }

    /// Open the binding's output stream. Only one stream per binding.
    ///
    /// A binding that ended before its stream was opened (process exit,
    /// delete, supersede) still yields its buffered output and the end.
    ///
    /// Dropping the returned stream before it ends releases the binding.
    pub fn read(&self, owner: &str, terminal_id: TerminalId) -> Result<OutputStream> {
        let session = self.session_for(owner, terminal_id, Access::Stream)?;
        let pending = session.take_stream(terminal_id)?;

        let bindings: Weak<BindingTable> = Arc::downgrade(&self.bindings);
        let release = Box::new(move || {
            session.detach(terminal_id, EndReason::TransportClosed);
            if let Some(bindings) = bindings.upgrade() {
                lock_table(&bindings).remove(&terminal_id);
            }
        });

        Ok(OutputStream::new(terminal_id, pending, release))
    }

    /// Release a binding. Unknown ids are ignored; the session stays alive.
    pub fn disconnect(&self, owner: &str, terminal_id: TerminalId) {
        let binding = {
            let mut table = self.table();
            let owned = table.get(&terminal_id).is_some_and(|b| b.owner == owner);
            if owned {
                table.remove(&terminal_id)
            } else {
                None
            }
        };

        if let Some(binding) = binding {
            binding.session.detach(terminal_id, EndReason::Detached);
        }
    }

    /// Number of bindings currently attached to a live session.
    pub fn active_bindings(&self) -> usize {
        self.table()
            .iter()
            .filter(|(id, binding)| binding.session.is_bound_to(**id))
            .count()
    }
}

fn lock_table(table: &BindingTable) -> MutexGuard<'_, HashMap<TerminalId, Binding>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}
