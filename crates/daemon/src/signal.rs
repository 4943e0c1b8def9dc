//! Process signals that start a graceful shutdown.

use std::io;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `shutdown` on the first SIGINT or SIGTERM (ctrl-c elsewhere).
///
/// Handlers are installed before this returns, so a signal delivered right
/// after the call is not lost.
#[cfg(unix)]
pub fn listen(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = shutdown.cancelled() => return,
        };
        info!(signal = name, "shutdown requested");
        shutdown.cancel();
    }))
}

#[cfg(not(unix))]
pub fn listen(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!(signal = "ctrl-c", "shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            },
            _ = shutdown.cancelled() => {}
        }
    }))
}
