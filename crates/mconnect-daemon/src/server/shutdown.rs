use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
///
/// When the signal is received, cancels the provided token to notify all
/// tasks to drain gracefully.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!(event = "daemon.server.signal_received", signal = "SIGINT");
                    }
                    _ = sigterm.recv() => {
                        info!(event = "daemon.server.signal_received", signal = "SIGTERM");
                    }
                }
            }
            Err(e) => {
                error!(
                    event = "daemon.server.signal_handler_failed",
                    error = %e,
                    "SIGTERM handler unavailable; only SIGINT and IPC shutdown will stop the daemon.",
                );
                let _ = ctrl_c.await;
                info!(event = "daemon.server.signal_received", signal = "SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!(event = "daemon.server.signal_received", signal = "SIGINT");
    }

    token.cancel();
}
