/// Process supervisor: owns one child command from spawn to reaping.
///
/// The command runs through a shell in its own process group (via
/// `process_group(0)`) so that a single `killpg` reclaims the shell and
/// everything it spawned. Stdout and stderr are drained by two reader tasks
/// into one bounded line queue; a third task reaps the child. Each task holds
/// a clone of the queue's sender, so the queue closes exactly once, after
/// both streams hit EOF and the exit status has been collected.
use crate::config::ProcessConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// One line of combined child output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
}

impl OutputLine {
    fn from_bytes(mut bytes: &[u8]) -> Self {
        if let Some(rest) = bytes.strip_suffix(b"\n") {
            bytes = rest;
        }
        if let Some(rest) = bytes.strip_suffix(b"\r") {
            bytes = rest;
        }
        Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Errors that can occur while starting a child.
#[derive(Debug)]
pub enum SpawnError {
    /// The shell could not be launched.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// An output pipe was not attached; the child has already been killed.
    Stream { stream: &'static str },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn { command, source } => {
                write!(f, "failed to spawn {:?}: {}", command, source)
            }
            SpawnError::Stream { stream } => {
                write!(f, "failed to attach child {}", stream)
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source, .. } => Some(source),
            SpawnError::Stream { .. } => None,
        }
    }
}

/// Errors that can occur while stopping a child.
#[derive(Debug)]
pub enum KillError {
    /// Signalling the process group failed.
    Signal { pgid: i32, source: Errno },
    /// Collecting the exit status failed.
    Wait { source: std::io::Error },
    /// The child was signalled but not reaped in time.
    Timeout { pgid: i32, timeout: Duration },
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillError::Signal { pgid, source } => {
                write!(f, "failed to signal process group {}: {}", pgid, source)
            }
            KillError::Wait { source } => {
                write!(f, "failed to wait for child exit: {}", source)
            }
            KillError::Timeout { pgid, timeout } => {
                write!(
                    f,
                    "process group {} did not exit within {}ms",
                    pgid,
                    timeout.as_millis()
                )
            }
        }
    }
}

impl std::error::Error for KillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KillError::Signal { source, .. } => Some(source),
            KillError::Wait { source } => Some(source),
            KillError::Timeout { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
enum ReapState {
    Running,
    Exited(ExitStatus),
    Failed(String),
}

/// Consumer end of a child's output. Yields lines until the child has been
/// reaped and both streams are drained, then `None` forever.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputLine>,
    exit_rx: watch::Receiver<ReapState>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }

    /// Exit status, once the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match &*self.exit_rx.borrow() {
            ReapState::Exited(status) => Some(*status),
            _ => None,
        }
    }
}

/// How a running child is taken down.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    /// SIGTERM the group and wait this long before SIGKILL. Zero skips SIGTERM.
    pub grace_period: Duration,
    /// Upper bound on waiting for the reaper after SIGKILL.
    pub kill_timeout: Duration,
}

/// Spawns supervised children with a fixed shell and stop policy.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    shell: String,
    output_buffer: usize,
    stop_policy: StopPolicy,
}

impl ProcessSupervisor {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            output_buffer: config.output_buffer.max(1),
            stop_policy: StopPolicy {
                grace_period: config.grace_period(),
                kill_timeout: config.kill_timeout(),
            },
        }
    }

    /// Launch `command` via `<shell> -c` in a new process group.
    ///
    /// Must be called from within a tokio runtime. On error no child is left
    /// running.
    pub fn start(&self, command: &str) -> Result<ProcessHandle, SpawnError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let Some(pid) = child.id() else {
            // Already reaped: nothing left to supervise
            return Err(SpawnError::Stream { stream: "pid" });
        };
        let pgid = Pid::from_raw(pid as i32);

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            (out, _) => {
                let stream = if out.is_none() { "stdout" } else { "stderr" };
                tracing::warn!(pid, stream, "output pipe missing, killing child");
                let _ = killpg(pgid, Signal::SIGKILL);
                reap_in_background(child);
                return Err(SpawnError::Stream { stream });
            }
        };

        tracing::info!(pid, shell = %self.shell, command, "child process started");

        let (tx, rx) = mpsc::channel(self.output_buffer);
        let (exit_tx, exit_rx) = watch::channel(ReapState::Running);
        let done = CancellationToken::new();

        spawn_reader(stdout, "stdout", tx.clone(), done.clone());
        spawn_reader(stderr, "stderr", tx.clone(), done.clone());
        spawn_reaper(child, pid, tx, exit_tx);

        Ok(ProcessHandle {
            pid,
            pgid,
            running: true,
            output: Some(OutputStream {
                rx,
                exit_rx: exit_rx.clone(),
            }),
            exit_rx,
            done,
            stop_policy: self.stop_policy,
        })
    }
}

/// A started child. Dropping a running handle SIGKILLs its group without
/// waiting; call [`ProcessHandle::stop`] to wait for the reap.
pub struct ProcessHandle {
    pid: u32,
    pgid: Pid,
    running: bool,
    output: Option<OutputStream>,
    exit_rx: watch::Receiver<ReapState>,
    done: CancellationToken,
    stop_policy: StopPolicy,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Take the output sequence. Only the first call returns `Some`.
    pub fn output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// True until `stop` is called or the child exits on its own.
    pub fn is_running(&self) -> bool {
        self.running && matches!(*self.exit_rx.borrow(), ReapState::Running)
    }

    /// Kill the whole process group and wait until the child is reaped.
    ///
    /// Idempotent: only the first call signals; later calls return `Ok`.
    pub async fn stop(&mut self) -> Result<(), KillError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        // Readers quit even if a stray descendant still holds a pipe open
        self.done.cancel();
        self.output = None;

        let pgid = self.pgid;
        let policy = self.stop_policy;

        if !policy.grace_period.is_zero() {
            if let Err(e) = self.signal_group(Signal::SIGTERM) {
                tracing::warn!(pgid = pgid.as_raw(), error = %e, "SIGTERM failed");
            }
            if self.wait_reaped(policy.grace_period).await.is_ok() {
                tracing::debug!(pgid = pgid.as_raw(), "child exited within grace period");
            }
        }

        // SIGKILL even after a reap: the leader may be gone while descendants linger
        self.signal_group(Signal::SIGKILL)
            .map_err(|e| KillError::Signal {
                pgid: pgid.as_raw(),
                source: e,
            })?;

        self.wait_reaped(policy.kill_timeout).await?;
        tracing::info!(pid = self.pid, "child process stopped");
        Ok(())
    }

    /// Signal the group unless it is known to be empty. Returns whether a
    /// signal was delivered.
    ///
    /// Once the leader is reaped its pgid stays reserved only while some
    /// member is alive; an empty group's id may already belong to someone
    /// else.
    fn signal_group(&self, signal: Signal) -> Result<bool, Errno> {
        let reaped = !matches!(*self.exit_rx.borrow(), ReapState::Running);
        if reaped && killpg(self.pgid, None) == Err(Errno::ESRCH) {
            tracing::debug!(pgid = self.pgid.as_raw(), ?signal, "process group already empty");
            return Ok(false);
        }
        tracing::debug!(pgid = self.pgid.as_raw(), ?signal, "signalling process group");
        match killpg(self.pgid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn wait_reaped(&mut self, limit: Duration) -> Result<(), KillError> {
        let pgid = self.pgid.as_raw();
        let waited = tokio::time::timeout(
            limit,
            self.exit_rx
                .wait_for(|state| !matches!(state, ReapState::Running)),
        )
        .await;

        let state = match waited {
            Err(_) => return Err(KillError::Timeout { pgid, timeout: limit }),
            Ok(Err(_)) => {
                return Err(KillError::Wait {
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "reaper ended without reporting an exit status",
                    ),
                })
            }
            Ok(Ok(state)) => state.clone(),
        };

        match state {
            ReapState::Failed(msg) => Err(KillError::Wait {
                source: std::io::Error::new(std::io::ErrorKind::Other, msg),
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.running {
            self.done.cancel();
            let _ = self.signal_group(Signal::SIGKILL);
        }
    }
}

fn spawn_reader<R>(
    stream: R,
    name: &'static str,
    tx: mpsc::Sender<OutputLine>,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = done.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = OutputLine::from_bytes(&buf);
                    // Block-producer: a full queue stalls this reader, not the child's peers
                    let sent = tokio::select! {
                        _ = done.cancelled() => break,
                        sent = tx.send(line) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = name, error = %e, "failed to read child output");
                    break;
                }
            }
        }
        tracing::debug!(stream = name, "output reader finished");
    });
}

fn spawn_reaper(
    mut child: Child,
    pid: u32,
    tx: mpsc::Sender<OutputLine>,
    exit_tx: watch::Sender<ReapState>,
) {
    tokio::spawn(async move {
        let state = match child.wait().await {
            Ok(status) => {
                tracing::info!(pid, exit_code = ?status.code(), "child process exited");
                ReapState::Exited(status)
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to wait for child");
                ReapState::Failed(e.to_string())
            }
        };
        exit_tx.send_replace(state);
        // Our sender goes last so the queue closes only after the reap
        drop(tx);
    });
}

fn reap_in_background(mut child: Child) {
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}
