/// Restart controller: the loop that turns change events into restarts.
///
/// The controller task is the only owner of the current [`ProcessHandle`].
/// Every other task sees the child only through messages posted to the
/// display inbox. A restart fully stops the old process group before the
/// debounce window starts, so two children never overlap.
use crate::display::DisplayHandle;
use crate::process::{OutputStream, ProcessHandle, ProcessSupervisor};
use crate::watcher::{ChangeEvent, WatchError, WatchEvent};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Consecutive stop failures after which a louder warning is logged.
const STOP_FAILURE_WARN_THRESHOLD: u32 = 3;

/// Status reported to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Starting,
    Running,
    ProcessExited,
    Restarting,
    Stopping,
    Stopped,
    StartFailed,
    StopFailed,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ControllerStatus::Starting => "Starting",
            ControllerStatus::Running => "Running",
            ControllerStatus::ProcessExited => "Process exited",
            ControllerStatus::Restarting => "Restarting",
            ControllerStatus::Stopping => "Stopping",
            ControllerStatus::Stopped => "Stopped",
            ControllerStatus::StartFailed => "Error: failed to start",
            ControllerStatus::StopFailed => "Error: failed to stop",
        };
        f.write_str(text)
    }
}

/// Internal state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
    Stopped,
}

/// Fatal controller errors. Both end the program.
#[derive(Debug)]
pub enum ControllerError {
    /// The watch source reported an unrecoverable failure.
    Watch(WatchError),
    /// The watch source ended without reporting why.
    WatchClosed,
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Watch(e) => write!(f, "file watcher failed: {}", e),
            ControllerError::WatchClosed => write!(f, "file watcher closed unexpectedly"),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControllerError::Watch(e) => Some(e),
            ControllerError::WatchClosed => None,
        }
    }
}

struct CurrentProcess {
    handle: ProcessHandle,
    /// Cancels this process's output forwarder.
    forwarder: CancellationToken,
}

pub struct RestartController {
    command: String,
    supervisor: ProcessSupervisor,
    display: DisplayHandle,
    debounce: Duration,
    phase: Phase,
    current: Option<CurrentProcess>,
    consecutive_stop_failures: u32,
}

enum Flow {
    Continue,
    Shutdown,
}

impl RestartController {
    pub fn new(
        command: impl Into<String>,
        supervisor: ProcessSupervisor,
        display: DisplayHandle,
        debounce: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            supervisor,
            display,
            debounce,
            phase: Phase::Idle,
            current: None,
            consecutive_stop_failures: 0,
        }
    }

    /// Start the command, then restart it on every change until `shutdown`
    /// fires or the watch source fails.
    ///
    /// The child is always stopped before this returns.
    pub async fn run(
        mut self,
        mut changes: mpsc::Receiver<WatchEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        self.start_process(&shutdown);

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                event = changes.recv() => event,
            };
            let change = match next_change(event) {
                Ok(change) => change,
                Err(e) => break Err(e),
            };
            match self.restart(change, &mut changes, &shutdown).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "stopping after fatal watcher failure");
        }
        self.shut_down().await;
        result
    }

    fn transition(&mut self, to: Phase) {
        tracing::debug!(from = ?self.phase, ?to, "controller transition");
        self.phase = to;
    }

    fn start_process(&mut self, shutdown: &CancellationToken) {
        self.transition(Phase::Starting);
        self.display.status(ControllerStatus::Starting);

        match self.supervisor.start(&self.command) {
            Ok(mut handle) => {
                self.display.status(ControllerStatus::Running);
                let forwarder = shutdown.child_token();
                if let Some(output) = handle.output() {
                    spawn_forwarder(output, self.display.clone(), forwarder.clone());
                }
                self.current = Some(CurrentProcess { handle, forwarder });
            }
            Err(e) => {
                // Not fatal: the next change retries
                tracing::error!(error = %e, command = %self.command, "failed to start process");
                self.display.status(ControllerStatus::StartFailed);
                self.display.output(format!("Error: {}", e));
            }
        }
        self.transition(Phase::Running);
    }

    /// Stop the current child, if any. Failures are reported and otherwise
    /// ignored so the next start still happens.
    async fn stop_current(&mut self) {
        let Some(mut current) = self.current.take() else {
            return;
        };
        current.forwarder.cancel();
        tracing::debug!(
            pid = current.handle.pid(),
            pgid = current.handle.pgid(),
            running = current.handle.is_running(),
            "stopping process"
        );

        match current.handle.stop().await {
            Ok(()) => self.consecutive_stop_failures = 0,
            Err(e) => {
                self.consecutive_stop_failures += 1;
                tracing::warn!(
                    error = %e,
                    pid = current.handle.pid(),
                    consecutive = self.consecutive_stop_failures,
                    "failed to stop process"
                );
                if self.consecutive_stop_failures >= STOP_FAILURE_WARN_THRESHOLD {
                    tracing::error!(
                        consecutive = self.consecutive_stop_failures,
                        "processes keep failing to stop; ports or files may still be held"
                    );
                }
                self.display.status(ControllerStatus::StopFailed);
                self.display.output(format!("Error: {}", e));
            }
        }
    }

    async fn restart(
        &mut self,
        change: ChangeEvent,
        changes: &mut mpsc::Receiver<WatchEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Flow, ControllerError> {
        tracing::info!(path = %change.path.display(), "file changed, restarting");
        self.transition(Phase::Restarting);
        self.display.status(ControllerStatus::Restarting);
        self.stop_current().await;

        // Debounce: absorb the rest of the burst, shutdown wins immediately
        let window = tokio::time::sleep(self.debounce);
        tokio::pin!(window);
        let mut absorbed = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Flow::Shutdown),
                _ = &mut window => break,
                event = changes.recv() => {
                    let change = next_change(event)?;
                    absorbed += 1;
                    tracing::debug!(path = %change.path.display(), "change absorbed by debounce");
                }
            }
        }
        if absorbed > 0 {
            tracing::debug!(absorbed, "coalesced changes into one restart");
        }

        self.display.clear();
        self.start_process(shutdown);
        Ok(Flow::Continue)
    }

    async fn shut_down(&mut self) {
        self.transition(Phase::ShuttingDown);
        if self.current.is_some() {
            self.display.status(ControllerStatus::Stopping);
            self.stop_current().await;
        }
        self.display.status(ControllerStatus::Stopped);
        self.transition(Phase::Stopped);
    }
}

fn next_change(event: Option<WatchEvent>) -> Result<ChangeEvent, ControllerError> {
    match event {
        Some(Ok(change)) => Ok(change),
        Some(Err(e)) => Err(ControllerError::Watch(e)),
        None => Err(ControllerError::WatchClosed),
    }
}

/// Forward child output to the display until the child ends or `cancel`
/// fires. Only a natural end reports `Process exited`.
fn spawn_forwarder(mut output: OutputStream, display: DisplayHandle, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                line = output.next() => match line {
                    Some(line) => display.output(line.text),
                    None => break,
                },
            }
        }
        display.status(ControllerStatus::ProcessExited);
        if let Some(status) = output.exit_status() {
            display.output(describe_exit(status));
        }
    });
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("process exited with code {}", code),
        (None, Some(signal)) => format!("process killed by signal {}", signal),
        (None, None) => "process exited".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::display::DisplayMsg;
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    use std::path::PathBuf;
    use std::time::Instant;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        changes: mpsc::Sender<WatchEvent>,
        inbox: mpsc::Receiver<DisplayMsg>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), ControllerError>>,
    }

    fn spawn_controller(command: &str, config: ProcessConfig, debounce: Duration) -> Harness {
        let (display, inbox) = DisplayHandle::channel(4096);
        let (changes, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let controller = RestartController::new(
            command,
            ProcessSupervisor::new(&config),
            display,
            debounce,
        );
        let task = tokio::spawn(controller.run(rx, shutdown.clone()));
        Harness {
            changes,
            inbox,
            shutdown,
            task,
        }
    }

    fn change(path: &str) -> WatchEvent {
        Ok(ChangeEvent {
            path: PathBuf::from(path),
        })
    }

    async fn next_msg(inbox: &mut mpsc::Receiver<DisplayMsg>) -> DisplayMsg {
        tokio::time::timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for display message")
            .expect("display inbox closed")
    }

    /// Collect messages up to and including the first matching one.
    async fn collect_until(
        inbox: &mut mpsc::Receiver<DisplayMsg>,
        until: impl Fn(&DisplayMsg) -> bool,
    ) -> Vec<DisplayMsg> {
        let mut seen = Vec::new();
        loop {
            let msg = next_msg(inbox).await;
            let done = until(&msg);
            seen.push(msg);
            if done {
                return seen;
            }
        }
    }

    fn statuses(msgs: &[DisplayMsg]) -> Vec<ControllerStatus> {
        msgs.iter()
            .filter_map(|m| match m {
                DisplayMsg::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    async fn drain(inbox: &mut mpsc::Receiver<DisplayMsg>) -> Vec<DisplayMsg> {
        let mut rest = Vec::new();
        while let Some(msg) = inbox.recv().await {
            rest.push(msg);
        }
        rest
    }

    #[test]
    fn test_status_texts() {
        assert_eq!(ControllerStatus::Starting.to_string(), "Starting");
        assert_eq!(ControllerStatus::ProcessExited.to_string(), "Process exited");
        assert_eq!(
            ControllerStatus::StartFailed.to_string(),
            "Error: failed to start"
        );
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(
            describe_exit(ExitStatus::from_raw(0)),
            "process exited with code 0"
        );
        assert_eq!(
            describe_exit(ExitStatus::from_raw(2 << 8)),
            "process exited with code 2"
        );
        assert_eq!(
            describe_exit(ExitStatus::from_raw(9)),
            "process killed by signal 9"
        );
    }

    #[tokio::test]
    async fn test_short_command_reports_exit() {
        let mut h = spawn_controller("printf hi", ProcessConfig::default(), Duration::from_millis(250));

        let msgs = collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::ProcessExited)
        })
        .await;
        assert_eq!(
            msgs,
            vec![
                DisplayMsg::Status(ControllerStatus::Starting),
                DisplayMsg::Status(ControllerStatus::Running),
                DisplayMsg::Output("hi".into()),
                DisplayMsg::Status(ControllerStatus::ProcessExited),
            ]
        );
        assert_eq!(
            next_msg(&mut h.inbox).await,
            DisplayMsg::Output("process exited with code 0".into())
        );

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
        let rest = statuses(&drain(&mut h.inbox).await);
        assert_eq!(rest.last(), Some(&ControllerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_change_restarts_after_old_group_is_gone() {
        let mut h = spawn_controller(
            "echo $$; exec sleep 30",
            ProcessConfig::default(),
            Duration::from_millis(250),
        );

        let first = collect_until(&mut h.inbox, |m| matches!(m, DisplayMsg::Output(_))).await;
        let DisplayMsg::Output(pid) = first.last().unwrap() else {
            unreachable!()
        };
        let old_pgid = Pid::from_raw(pid.trim().parse().unwrap());
        assert!(killpg(old_pgid, None).is_ok());

        let sent_at = Instant::now();
        h.changes.send(change("src/app.ts")).await.unwrap();

        let msgs = collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::Starting)
        })
        .await;
        assert!(sent_at.elapsed() >= Duration::from_millis(250));
        // The old group was reaped before the new one starts
        assert_eq!(killpg(old_pgid, None), Err(Errno::ESRCH));
        assert_eq!(
            msgs,
            vec![
                DisplayMsg::Status(ControllerStatus::Restarting),
                DisplayMsg::Clear,
                DisplayMsg::Status(ControllerStatus::Starting),
            ]
        );

        // Killed process does not report a natural exit
        let next = collect_until(&mut h.inbox, |m| matches!(m, DisplayMsg::Output(_))).await;
        assert_eq!(statuses(&next), vec![ControllerStatus::Running]);
        let DisplayMsg::Output(new_pid) = next.last().unwrap() else {
            unreachable!()
        };
        assert_ne!(new_pid, pid);

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(
            statuses(&drain(&mut h.inbox).await),
            vec![ControllerStatus::Stopping, ControllerStatus::Stopped]
        );
        let new_pgid = Pid::from_raw(new_pid.trim().parse().unwrap());
        assert_eq!(killpg(new_pgid, None), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_burst_of_changes_restarts_once() {
        let mut h = spawn_controller(
            "exec sleep 30",
            ProcessConfig::default(),
            Duration::from_millis(250),
        );
        collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::Running)
        })
        .await;

        for i in 0..10 {
            h.changes.send(change(&format!("src/file{i}.ts"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
        let all = statuses(&drain(&mut h.inbox).await);
        let count = |s: ControllerStatus| all.iter().filter(|x| **x == s).count();
        assert_eq!(count(ControllerStatus::Restarting), 1);
        assert_eq!(count(ControllerStatus::Starting), 1);
        assert_eq!(count(ControllerStatus::Running), 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_debounce() {
        let mut h = spawn_controller(
            "exec sleep 30",
            ProcessConfig::default(),
            Duration::from_secs(10),
        );
        collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::Running)
        })
        .await;

        h.changes.send(change("src/app.ts")).await.unwrap();
        collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::Restarting)
        })
        .await;
        // Let the stop finish so only the debounce wait remains
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cancelled_at = Instant::now();
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
        let elapsed = cancelled_at.elapsed();
        assert!(elapsed < Duration::from_millis(50), "shutdown took {elapsed:?}");

        // No replacement was started and there was nothing left to stop
        assert_eq!(
            statuses(&drain(&mut h.inbox).await),
            vec![ControllerStatus::Stopped]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_fatal() {
        let config = ProcessConfig {
            shell: "/nonexistent/shell-xyz".to_string(),
            ..Default::default()
        };
        let mut h = spawn_controller("echo never", config, Duration::from_millis(50));

        let msgs = collect_until(&mut h.inbox, |m| matches!(m, DisplayMsg::Output(_))).await;
        assert_eq!(
            statuses(&msgs),
            vec![ControllerStatus::Starting, ControllerStatus::StartFailed]
        );
        let DisplayMsg::Output(line) = msgs.last().unwrap() else {
            unreachable!()
        };
        assert!(line.starts_with("Error: failed to spawn"));

        // Still watching: the next change tries again
        h.changes.send(change("src/app.ts")).await.unwrap();
        let msgs = collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::StartFailed)
        })
        .await;
        assert_eq!(
            statuses(&msgs),
            vec![
                ControllerStatus::Restarting,
                ControllerStatus::Starting,
                ControllerStatus::StartFailed
            ]
        );

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_watch_source_is_fatal_and_stops_child() {
        let mut h = spawn_controller(
            "echo $$; exec sleep 30",
            ProcessConfig::default(),
            Duration::from_millis(50),
        );
        let first = collect_until(&mut h.inbox, |m| matches!(m, DisplayMsg::Output(_))).await;
        let DisplayMsg::Output(pid) = first.last().unwrap() else {
            unreachable!()
        };
        let pgid = Pid::from_raw(pid.trim().parse().unwrap());

        drop(h.changes);
        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ControllerError::WatchClosed)));
        assert_eq!(killpg(pgid, None), Err(Errno::ESRCH));
        assert_eq!(
            statuses(&drain(&mut h.inbox).await),
            vec![ControllerStatus::Stopping, ControllerStatus::Stopped]
        );
    }

    #[tokio::test]
    async fn test_watch_error_is_fatal() {
        let mut h = spawn_controller("exec sleep 30", ProcessConfig::default(), Duration::from_millis(50));
        collect_until(&mut h.inbox, |m| {
            *m == DisplayMsg::Status(ControllerStatus::Running)
        })
        .await;

        h.changes
            .send(Err(WatchError::RootRemoved {
                path: PathBuf::from("/project"),
            }))
            .await
            .unwrap();
        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, ControllerError::Watch(WatchError::RootRemoved { .. })));
        assert!(err.to_string().contains("/project"));
    }
}
