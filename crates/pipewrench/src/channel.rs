//! Pipe channel engine: one external filter process and its byte conduits.
//!
//! Wraps a child process spawned through the system shell with its stdin
//! piped (and, in bidirectional mode, its stdout piped as well). The channel
//! owns the only handles to the child: `close` reaps it, and `reset`
//! replaces it with a fresh one running the same command line. Each unit
//! of work gets a fresh process; line-buffering filters only flush
//! reliably on process exit.

use std::io;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Lifecycle states of a [`PipeChannel`].
///
/// `Closed → Opening → {OpenUni | OpenBi} → [Widowed] → Closed`, cycling
/// again through `reset`. `Widowed` is a bidirectional channel whose write
/// side has been closed but whose output has not yet been fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    OpenUni,
    OpenBi,
    Widowed,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn filter process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawned filter process has no {0} handle")]
    MissingConduit(&'static str),
}

/// A child process executing a shell command line, plus its conduits.
///
/// Exclusively owned by the interceptor that created it; state-violating
/// accessor calls are programming faults and panic.
pub struct PipeChannel {
    state: ChannelState,
    command_line: String,
    bidirectional: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl PipeChannel {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            state: ChannelState::Closed,
            command_line: command_line.into(),
            bidirectional: false,
            child: None,
            stdin: None,
            stdout: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Pid of the live child, if any.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Spawns the stored command with its stdin piped and its stdout left on
    /// the parent's stdout. `Closed → OpenUni`.
    pub fn open(&mut self) -> Result<(), SpawnError> {
        self.bidirectional = false;
        self.spawn_child()
    }

    /// Spawns the stored command with both stdin and stdout piped, so the
    /// filtered output can be read back. `Closed → OpenBi`.
    pub fn open_bidirectional(&mut self) -> Result<(), SpawnError> {
        self.bidirectional = true;
        self.spawn_child()
    }

    fn spawn_child(&mut self) -> Result<(), SpawnError> {
        assert_eq!(
            self.state,
            ChannelState::Closed,
            "open on a channel that is not closed"
        );
        self.state = ChannelState::Opening;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.command_line)
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit());
        if self.bidirectional {
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = ChannelState::Closed;
                return Err(SpawnError::Spawn(e));
            }
        };

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                self.state = ChannelState::Closed;
                return Err(SpawnError::MissingConduit("stdin"));
            }
        };
        self.stdin = Some(stdin);

        if self.bidirectional {
            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    self.state = ChannelState::Closed;
                    return Err(SpawnError::MissingConduit("stdout"));
                }
            };
            self.stdout = Some(stdout);
        }

        tracing::info!(
            pid = child.id(),
            bidirectional = self.bidirectional,
            command = %self.command_line,
            "Spawned filter process"
        );
        self.child = Some(child);
        self.state = if self.bidirectional {
            ChannelState::OpenBi
        } else {
            ChannelState::OpenUni
        };
        Ok(())
    }

    /// Write conduit to the child's stdin. Valid only while open.
    pub fn writer(&mut self) -> &mut ChildStdin {
        assert!(
            matches!(self.state, ChannelState::OpenUni | ChannelState::OpenBi),
            "write conduit is only valid while the channel is open"
        );
        self.stdin
            .as_mut()
            .expect("open channel is missing its write conduit")
    }

    /// Read conduit from the child's stdout. Valid in bidirectional and
    /// widowed states.
    pub fn reader(&mut self) -> &mut ChildStdout {
        assert!(
            matches!(self.state, ChannelState::OpenBi | ChannelState::Widowed),
            "read conduit is only valid on a bidirectional or widowed channel"
        );
        self.stdout
            .as_mut()
            .expect("bidirectional channel is missing its read conduit")
    }

    /// Closes the write conduit so the child observes end-of-file on its
    /// stdin. `OpenBi → Widowed`. Writing past this point would fault on a
    /// broken pipe, so the accessor refuses it.
    pub fn send_end_of_input(&mut self) {
        assert_eq!(
            self.state,
            ChannelState::OpenBi,
            "end-of-input on a channel that is not open bidirectionally"
        );
        self.stdin = None;
        self.state = ChannelState::Widowed;
        tracing::debug!(pid = self.child_id(), "Sent end-of-input to filter process");
    }

    /// Closes any remaining conduits and reaps the child, classifying how it
    /// went away. Any non-closed state `→ Closed`.
    pub async fn close(&mut self) -> io::Result<()> {
        assert_ne!(self.state, ChannelState::Closed, "close on a closed channel");
        self.stdin = None;
        self.stdout = None;

        let Some(mut child) = self.child.take() else {
            self.state = ChannelState::Closed;
            return Ok(());
        };
        let pid = child.id();
        tracing::debug!(pid, "Waiting for filter process to exit");
        let status = child.wait().await?;

        if let Some(code) = status.code() {
            tracing::info!(pid, code, "Filter process exited");
        } else {
            classify_signal_exit(pid, &status);
        }

        self.state = ChannelState::Closed;
        Ok(())
    }

    /// `close` followed by a re-open with the stored command line and prior
    /// mode. Gives the next unit of work a fresh filter process.
    pub async fn reset(&mut self) -> Result<(), SpawnError> {
        self.close().await?;
        tracing::debug!(command = %self.command_line, "Resetting pipe channel");
        if self.bidirectional {
            self.open_bidirectional()
        } else {
            self.open()
        }
    }

    /// Forcibly terminates the child, then reaps it. Used when a filter
    /// refuses to drain.
    pub async fn kill(&mut self) -> io::Result<()> {
        if let Some(child) = self.child.as_mut() {
            tracing::warn!(pid = child.id(), "Killing unresponsive filter process");
            child.start_kill()?;
        }
        self.close().await
    }
}

#[cfg(unix)]
fn classify_signal_exit(pid: Option<u32>, status: &std::process::ExitStatus) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        tracing::info!(pid, signal, "Filter process terminated by signal");
    } else if let Some(signal) = status.stopped_signal() {
        // Anomalous: the child is stopped, not gone. We do not restart it.
        tracing::warn!(pid, signal, "Filter process stopped by signal");
    } else {
        tracing::warn!(pid, "Filter process ended without exit code or signal");
    }
}

#[cfg(not(unix))]
fn classify_signal_exit(pid: Option<u32>, _status: &std::process::ExitStatus) {
    tracing::warn!(pid, "Filter process ended without exit code");
}
