//! cockpit-pty: durable shell sessions and the terminal bridge.
//!
//! Sessions are shell processes on a PTY that outlive any client. Clients
//! reach them through short-lived bindings that carry input, resizes, and an
//! ordered output stream.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: Low-level PTY process management (spawn, read, write, resize).
//! - [`SessionRegistry`]: Owns named [`Session`]s per owner, bounded in number.
//! - [`TerminalBridge`]: Issues [`TerminalId`]s and routes calls to sessions.
//! - [`OutputStream`]: Ordered, backpressured output of one binding.

pub mod bridge;
pub mod error;
mod io_thread;
pub mod pty;
pub mod registry;
pub mod session;
pub mod stream;

pub use bridge::{TerminalBridge, TerminalId};
pub use error::{Error, ErrorKind, Result};
pub use pty::{PtyError, PtyHandle, ShellCommand};
pub use registry::{RegistryConfig, SessionList, SessionRegistry};
pub use session::{Session, SessionInfo, SpawnOptions};
pub use stream::{EndReason, OutputStream, StreamEvent, Utf8Chunker};
