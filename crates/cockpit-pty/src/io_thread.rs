//! Per-session I/O threads.
//!
//! PTY reads and writes are blocking, so each session gets two dedicated OS
//! threads: one draining shell output into the attached binding, one applying
//! queued input and resizes in arrival order. Neither holds the session lock
//! while blocked.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{Child, MasterPty};
use tokio::sync::mpsc;

use crate::pty::resize_master;
use crate::session::Session;
use crate::stream::EndReason;

/// Work items for the input thread.
#[derive(Debug)]
pub(crate) enum InputCommand {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// How long to wait for the child to become reapable after the PTY closes.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Start the input loop for a session on a dedicated OS thread.
///
/// The thread owns the PTY master and writer; it exits when every input
/// sender is dropped, which closes the master side of the PTY.
pub(crate) fn start_input_thread(
    session_name: &str,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    input_rx: mpsc::Receiver<InputCommand>,
) -> std::io::Result<()> {
    let name = session_name.to_string();
    std::thread::Builder::new()
        .name(format!("pty-in-{session_name}"))
        .spawn(move || input_loop(&name, master, writer, input_rx))?;
    Ok(())
}

fn input_loop(
    session_name: &str,
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<InputCommand>,
) {
    while let Some(command) = input_rx.blocking_recv() {
        match command {
            InputCommand::Data(data) => {
                if let Err(err) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    log::warn!("Session {session_name}: input write failed: {err}");
                    return;
                }
            }
            InputCommand::Resize { rows, cols } => {
                if let Err(err) = resize_master(master.as_ref(), rows, cols) {
                    log::warn!("Session {session_name}: {err}");
                }
            }
        }
    }
    log::debug!("Session {session_name}: input thread stopped");
}

/// Start the output loop for a session on a dedicated OS thread.
///
/// The thread owns the PTY reader and the child process. It reaps the child
/// once the PTY closes and reports how the session ended.
pub(crate) fn start_output_thread(
    session: Arc<Session>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    chunk_size: usize,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-out-{}", session.name()))
        .spawn(move || output_loop(session, reader, child, chunk_size))?;
    Ok(())
}

fn output_loop(
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];

    // Linux reports a closed PTY as EIO rather than EOF, so a read error is
    // only a fault if the child turns out to be still running.
    let fault = loop {
        match reader.read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => session.route_output(buf[..n].to_vec()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break Some(err),
        }
    };

    let exit_code = wait_for_exit(child.as_mut(), EXIT_GRACE);
    if exit_code.is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }

    let reason = match (exit_code, fault) {
        (Some(code), _) => EndReason::ProcessExited { code: Some(code) },
        (None, Some(err)) => EndReason::Error {
            message: format!("PTY read failed: {err}"),
        },
        (None, None) => EndReason::ProcessExited { code: None },
    };
    log::debug!("Session {}: output thread stopped ({})", session.name(), reason.as_str());
    session.finish_output(reason);
}

fn wait_for_exit(child: &mut (dyn Child + Send + Sync), grace: Duration) -> Option<u32> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => return None,
        }
    }
}
