/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request shutdown: the controller stops
/// the child's process group and then the program exits. Repeated signals
/// while shutting down are logged and otherwise ignored, since the stop is
/// already bounded by the kill timeout.
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install SIGINT/SIGTERM handlers that cancel `shutdown`.
pub fn install(shutdown: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            if shutdown.is_cancelled() {
                tracing::warn!(signal = name, "shutdown already in progress");
            } else {
                tracing::info!(signal = name, "shutdown requested");
                shutdown.cancel();
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_cancels_shutdown_token() {
        let shutdown = CancellationToken::new();
        let _task = install(shutdown.clone()).unwrap();

        raise(Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .expect("shutdown was not requested");

        // A second signal is harmless
        raise(Signal::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(shutdown.is_cancelled());
    }
}
