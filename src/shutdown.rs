use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` when SIGTERM or SIGINT is received.
///
/// Workers watching the token finish their current job and exit. The listener
/// also returns quietly if the token is cancelled by something else first,
/// e.g. a `worker stop` request picked up by the pool heartbeat.
pub fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping workers");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping workers");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });
}
