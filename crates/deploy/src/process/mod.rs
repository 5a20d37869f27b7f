//! Cross-platform handle over a launched child process.
//!
//! The child is started in its own process group so that every descendant (a `npx`
//! wrapper and the node it spawns, for instance) can be signalled together. How a group is
//! created and signalled differs per operating system and lives behind [`ProcessControl`];
//! the implementation is picked once, when the handle is started.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::{
    collections::VecDeque,
    fmt, io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

use crate::error::LaunchError;

#[cfg(unix)]
pub use unix::UnixProcessGroup;
#[cfg(windows)]
pub use windows::WindowsProcessTree;

/// Interval between liveness checks while waiting for a graceful exit.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on reaping a process after it was force-killed.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of output lines kept for error reports.
const CAPTURED_OUTPUT_LINES: usize = 200;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Split `[program, args...]`.
    pub fn from_parts(parts: Vec<String>) -> Result<Self, LaunchError> {
        let mut parts = parts.into_iter();
        let program = parts.next().ok_or(LaunchError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Platform-specific process-group handling.
pub trait ProcessControl: fmt::Debug + Send + Sync {
    /// Build the command so that the child leads a new process group.
    fn command(&self, line: &CommandLine) -> Command;

    /// Ask the whole group to stop.
    fn signal_graceful(&self, pid: u32) -> io::Result<()>;

    /// Kill the whole group. Succeeds if the group is already gone.
    fn force_kill(&self, pid: u32) -> io::Result<()>;
}

/// The [`ProcessControl`] for the current operating system.
pub fn platform_control() -> Box<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Box::new(UnixProcessGroup)
    }
    #[cfg(windows)]
    {
        Box::new(WindowsProcessTree)
    }
}

/// The last lines written by a child on stdout and stderr.
#[derive(Debug, Clone, Default)]
struct CapturedOutput(Arc<Mutex<VecDeque<String>>>);

impl CapturedOutput {
    fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == CAPTURED_OUTPUT_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Forward a child stream to the logs, keeping the tail for error reports.
fn drain<R>(
    stream: R,
    program: String,
    stream_name: &'static str,
    output: CapturedOutput,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(
                        target: "chainup::node",
                        %program,
                        stream = stream_name,
                        "{}",
                        line
                    );
                    output.push(line);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::trace!(
                        %program,
                        stream = stream_name,
                        error = %err,
                        "Stopped reading child output"
                    );
                    break;
                }
            }
        }
    })
}

/// A launched child process and its process group.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
    started_at: DateTime<Utc>,
    exit_status: Option<ExitStatus>,
    finished: bool,
    output: CapturedOutput,
    readers: Vec<JoinHandle<()>>,
    control: Box<dyn ProcessControl>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("started_at", &self.started_at)
            .field("exit_status", &self.exit_status)
            .field("control", &self.control)
            .finish()
    }
}

impl ProcessHandle {
    /// Launch `command` in its own process group.
    pub fn start(
        command: &CommandLine,
        working_directory: Option<&Path>,
    ) -> Result<Self, LaunchError> {
        Self::start_with(command, working_directory, platform_control())
    }

    /// Launch `command` with an explicit [`ProcessControl`].
    pub fn start_with(
        command: &CommandLine,
        working_directory: Option<&Path>,
        control: Box<dyn ProcessControl>,
    ) -> Result<Self, LaunchError> {
        let mut cmd = control.command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_directory {
            cmd.current_dir(dir);
        }

        let program = command.program.clone();
        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                program: program.clone(),
                source,
            },
            _ => LaunchError::Spawn {
                program: program.clone(),
                source,
            },
        })?;

        let pid = child.id().ok_or_else(|| LaunchError::Spawn {
            program: program.clone(),
            source: io::Error::other("child exited before its pid could be read"),
        })?;

        let output = CapturedOutput::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(stdout, program.clone(), "stdout", output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(stderr, program.clone(), "stderr", output.clone()));
        }

        tracing::debug!(pid, command = %command, "Process started");

        Ok(Self {
            child,
            pid,
            program,
            started_at: Utc::now(),
            exit_status: None,
            finished: false,
            output,
            readers,
            control,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        if self.finished || self.exit_status.is_some() {
            return false;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(pid = self.pid, error = %err, "Failed to query process status");
                false
            }
        }
    }

    /// Output captured so far. Waits at most `settle` for the output pipes to close, which
    /// lets the tail of a process that just exited reach the buffer.
    pub async fn captured_output(&mut self, settle: Duration) -> String {
        let readers = std::mem::take(&mut self.readers);
        let _ = timeout(settle, join_readers(readers)).await;
        self.output.snapshot()
    }

    /// Stop the process group: graceful signal, wait up to `grace_period`, then kill.
    ///
    /// When this returns, [`Self::is_alive`] is false.
    pub async fn terminate(&mut self, grace_period: Duration) {
        if !self.is_alive() {
            self.finished = true;
            return;
        }

        tracing::debug!(
            pid = self.pid,
            program = %self.program,
            ?grace_period,
            "Stopping process group"
        );

        if let Err(err) = self.control.signal_graceful(self.pid) {
            tracing::warn!(pid = self.pid, error = %err, "Failed to signal process group");
        }

        let deadline = Instant::now() + grace_period;
        while self.is_alive() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(TERMINATE_POLL_INTERVAL.min(deadline - now)).await;
        }

        if self.is_alive() {
            tracing::warn!(
                pid = self.pid,
                program = %self.program,
                "Process did not exit within the grace period, killing it"
            );
            if let Err(err) = self.control.force_kill(self.pid) {
                tracing::warn!(pid = self.pid, error = %err, "Failed to kill process group");
            }
            let _ = self.child.start_kill();
            match timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
                Ok(Ok(status)) => self.exit_status = Some(status),
                Ok(Err(err)) => {
                    tracing::warn!(pid = self.pid, error = %err, "Failed to reap killed process")
                }
                Err(_) => tracing::warn!(pid = self.pid, "Timed out reaping killed process"),
            }
        } else if let Err(err) = self.control.force_kill(self.pid) {
            // Leader is gone; sweep descendants that ignored the graceful signal.
            tracing::trace!(pid = self.pid, error = %err, "Group sweep failed");
        }

        self.finished = true;
        tracing::debug!(pid = self.pid, status = ?self.exit_status, "Process stopped");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.finished && matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.control.force_kill(self.pid);
        }
    }
}

async fn join_readers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
