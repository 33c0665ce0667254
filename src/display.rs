/// Display inbox and a plain terminal renderer.
///
/// The controller and output forwarders post [`DisplayMsg`]s through a
/// [`DisplayHandle`]; posting never blocks. When the inbox is full the new
/// message is dropped. [`TerminalDisplay`] drains the inbox on its own task.
use crate::controller::ControllerStatus;
use std::collections::VecDeque;
use std::io::{BufRead, IsTerminal, Write};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayMsg {
    Status(ControllerStatus),
    Output(String),
    Clear,
}

/// Sending side of the display inbox.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    tx: mpsc::Sender<DisplayMsg>,
}

impl DisplayHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DisplayMsg>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn status(&self, status: ControllerStatus) {
        self.post(DisplayMsg::Status(status));
    }

    pub fn output(&self, line: impl Into<String>) {
        self.post(DisplayMsg::Output(line.into()));
    }

    pub fn clear(&self) {
        self.post(DisplayMsg::Clear);
    }

    fn post(&self, msg: DisplayMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::debug!(?msg, "display inbox full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("display inbox closed");
            }
        }
    }
}

/// Line-oriented renderer: status changes and child output go to one writer.
pub struct TerminalDisplay<W: Write> {
    out: W,
    status: Option<ControllerStatus>,
    log: VecDeque<String>,
    max_lines: usize,
    clear_screen: bool,
    broken: bool,
}

impl TerminalDisplay<std::io::Stdout> {
    /// Render to stdout; clearing uses ANSI escapes only on a terminal.
    pub fn stdout(max_lines: usize) -> Self {
        let out = std::io::stdout();
        let clear_screen = out.is_terminal();
        Self::new(out, max_lines, clear_screen)
    }
}

impl<W: Write> TerminalDisplay<W> {
    pub fn new(out: W, max_lines: usize, clear_screen: bool) -> Self {
        Self {
            out,
            status: None,
            log: VecDeque::new(),
            max_lines: max_lines.max(1),
            clear_screen,
            broken: false,
        }
    }

    pub fn status(&self) -> Option<&ControllerStatus> {
        self.status.as_ref()
    }

    /// Retained output, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(String::as_str)
    }

    pub fn apply(&mut self, msg: DisplayMsg) -> std::io::Result<()> {
        match msg {
            DisplayMsg::Status(status) => {
                writeln!(self.out, "[devloop] {}", status)?;
                self.status = Some(status);
            }
            DisplayMsg::Output(line) => {
                writeln!(self.out, "{}", line)?;
                if self.log.len() == self.max_lines {
                    self.log.pop_front();
                }
                self.log.push_back(line);
            }
            DisplayMsg::Clear => {
                self.log.clear();
                if self.clear_screen {
                    write!(self.out, "{}", CLEAR_SCREEN)?;
                }
            }
        }
        self.out.flush()
    }

    /// Drain the inbox until every handle is dropped.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<DisplayMsg>) -> Self {
        while let Some(msg) = inbox.recv().await {
            if let Err(e) = self.apply(msg) {
                // Keep draining so senders never see a stuck inbox
                if !self.broken {
                    tracing::warn!(error = %e, "display output failed");
                    self.broken = true;
                }
            }
        }
        tracing::debug!("display inbox closed");
        self
    }
}

/// Treat `q` (or `quit`) on stdin as a user quit request.
///
/// Runs on a plain thread: a blocking stdin read inside the runtime would
/// hold up runtime shutdown.
pub fn spawn_quit_listener(quit: CancellationToken) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if is_quit_command(&line) {
                tracing::info!("quit requested from terminal");
                quit.cancel();
                break;
            }
        }
    });
}

fn is_quit_command(line: &str) -> bool {
    matches!(line.trim(), "q" | "quit")
}
