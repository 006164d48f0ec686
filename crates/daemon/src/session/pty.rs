//! PTY-backed managed processes.
//!
//! A [`ManagedProcess`] owns one child process bound to a pseudo-terminal.
//! Output and the final exit code are delivered to a [`ProcessSink`]; input
//! is queued to a blocking writer so callers never wait on the child.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::SessionId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during process operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the PTY or its child.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The process no longer accepts input.
    #[error("process input closed: {0}")]
    InputClosed(SessionId),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit code reported for a process that could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// How long a hung-up process may linger before its group is killed.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Receives everything a managed process produces.
///
/// `output` is called in the order the child wrote its bytes; `exited` is
/// called exactly once, after the last `output`.
pub trait ProcessSink: Send + Sync + 'static {
    /// A decoded chunk of terminal output.
    fn output(&self, data: String);

    /// The process terminated with the given exit code.
    fn exited(&self, code: i32);
}

/// What to run and how to size its terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Initial width.
    pub cols: u16,
    /// Initial height.
    pub rows: u16,
    /// Value of TERM in the child environment.
    pub term: String,
}

/// A child process running on a pseudo-terminal.
pub struct ManagedProcess {
    id: SessionId,
    master: Box<dyn MasterPty + Send>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    finished: Arc<AtomicBool>,
    pid: Option<u32>,
    runtime: tokio::runtime::Handle,
    signalled: bool,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish()
    }
}

impl ManagedProcess {
    /// Spawns `spec` on a fresh PTY and starts its I/O tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        id: &str,
        spec: &ProcessSpec,
        sink: Arc<dyn ProcessSink>,
    ) -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", &spec.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Only the child may hold the slave, otherwise the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (input, input_rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));

        runtime.spawn_blocking({
            let id = id.to_string();
            move || write_loop(id, writer, input_rx)
        });
        runtime.spawn(read_loop(
            id.to_string(),
            reader,
            child,
            sink,
            Arc::clone(&finished),
        ));

        tracing::info!(
            session_id = %id,
            program = %spec.program,
            cwd = %spec.cwd.display(),
            pid = ?pid,
            "Spawned managed process"
        );

        Ok(Self {
            id: id.to_string(),
            master: pair.master,
            input,
            killer,
            finished,
            pid,
            runtime,
            signalled: false,
        })
    }

    /// Returns the session this process backs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the child has been reaped.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Queues bytes for the child's input.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.input
            .send(data.to_vec())
            .map_err(|_| SessionError::InputClosed(self.id.clone()))
    }

    /// Resizes the pseudo-terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Hangs up the child, then kills its process group if it is still
    /// running after [`KILL_GRACE`]. The sink still receives its exit code.
    pub fn kill(&mut self) -> Result<(), SessionError> {
        if self.signalled || self.is_finished() {
            return Ok(());
        }
        self.signalled = true;

        if let Err(e) = self.killer.kill() {
            tracing::debug!(session_id = %self.id, error = %e, "Hangup failed, killing now");
            return self.force_kill();
        }

        let id = self.id.clone();
        let pid = self.pid;
        let finished = Arc::clone(&self.finished);
        self.runtime.spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            if finished.load(Ordering::SeqCst) {
                return;
            }
            tracing::info!(session_id = %id, "Process survived hangup, sending SIGKILL");
            if let Err(e) = kill_process_group(pid) {
                tracing::warn!(session_id = %id, error = %e, "Failed to kill process group");
            }
        });

        tracing::info!(session_id = %self.id, "Hung up managed process");
        Ok(())
    }

    /// Kills the child and its process group immediately.
    pub fn terminate(&mut self) -> Result<(), SessionError> {
        if self.is_finished() {
            return Ok(());
        }
        self.signalled = true;
        self.force_kill()
    }

    fn force_kill(&mut self) -> Result<(), SessionError> {
        if cfg!(unix) && self.pid.is_some() {
            kill_process_group(self.pid)?;
        } else {
            self.killer
                .kill()
                .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        }
        tracing::info!(session_id = %self.id, "Killed managed process");
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::debug!(session_id = %self.id, error = %e, "Kill on drop failed");
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`.
///
/// Children are spawned as session leaders, so the group also holds anything
/// they started on the terminal.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) -> Result<(), SessionError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::KillFailed(e.to_string())),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) -> Result<(), SessionError> {
    Ok(())
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn write_loop(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::warn!(session_id = %id, error = %e, "Error writing to PTY");
            break;
        }
    }
    tracing::debug!(session_id = %id, "PTY writer finished");
}

async fn read_loop(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    sink: Arc<dyn ProcessSink>,
    finished: Arc<AtomicBool>,
) {
    let mut decoder = Utf8ChunkDecoder::default();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let result = tokio::task::spawn_blocking(move || {
            let read = reader.read(&mut buffer);
            (reader, buffer, read)
        })
        .await;

        let (returned_reader, returned_buffer, read) = match result {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Read task panicked");
                break;
            }
        };
        reader = returned_reader;
        buffer = returned_buffer;

        match read {
            Ok(0) => {
                tracing::info!(session_id = %id, "PTY EOF - process exited");
                break;
            }
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    sink.output(text);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is gone.
                tracing::debug!(session_id = %id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    if let Some(rest) = decoder.finish() {
        sink.output(rest);
    }

    let code = match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(Ok(status)) => status.exit_code() as i32,
        Ok(Err(e)) => {
            tracing::warn!(session_id = %id, error = %e, "Failed to reap child");
            SPAWN_FAILURE_EXIT_CODE
        }
        Err(e) => {
            tracing::error!(session_id = %id, error = %e, "Wait task panicked");
            SPAWN_FAILURE_EXIT_CODE
        }
    };

    finished.store(true, Ordering::SeqCst);
    tracing::info!(session_id = %id, exit_code = code, "Managed process exited");
    sink.exited(code);
}

/// Turns a byte stream into text without splitting multi-byte characters.
///
/// Incomplete trailing sequences are held back until the next chunk; invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    /// Decodes as much of `pending + bytes` as forms complete characters.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flushes any held-back bytes at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
