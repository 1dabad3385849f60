use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Errors from PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
}

/// The program a session runs inside its PTY.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    /// Program to execute. `None` uses the user's default shell.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ShellCommand {
    /// A command running `program` with `args`.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: Some(program.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        }
    }

    fn builder(&self) -> CommandBuilder {
        let program = self.program.clone().unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&self.args);
        cmd.env("TERM", "xterm-256color");
        if let Some(dir) = &self.working_dir {
            cmd.cwd(dir);
        }
        cmd
    }
}

/// The halves of a spawned PTY, split so that blocking reads, writes and
/// child management can live on different threads.
pub struct PtyParts {
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// Owns a portable-pty child process, master pair, reader, and writer.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Spawn `command` on a new PTY with the given dimensions.
    pub fn spawn(command: &ShellCommand, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(rows, cols))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(command.builder())
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn command: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        Ok(Self {
            master: pair.master,
            reader,
            writer,
            child,
        })
    }

    /// Process id of the child, if the platform exposes one.
    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Split the handle into its independently owned parts.
    pub fn into_parts(self) -> PtyParts {
        PtyParts {
            master: self.master,
            reader: self.reader,
            writer: self.writer,
            child: self.child,
        }
    }
}

pub(crate) fn resize_master(master: &dyn MasterPty, rows: u16, cols: u16) -> Result<(), PtyError> {
    master
        .resize(pty_size(rows, cols))
        .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
