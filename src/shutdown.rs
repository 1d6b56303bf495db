//! Signal handling for the daemon and long-running CLI commands.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel a fresh token on the first SIGTERM or SIGINT.
///
/// The watcher task exits without cancelling if the token is cancelled by
/// someone else first. Must be called from within a tokio runtime.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = trigger.cancelled() => return,
        };
        tracing::info!(signal = received, "Shutdown signal received");
        trigger.cancel();
    });

    Ok(token)
}
