//! Graceful-shutdown signaling
//!
//! One watch channel per process: SIGINT/SIGTERM flip it to `true`, and
//! every long-running task selects on it to stop accepting work and
//! drain.

use tokio::sync::watch;
use tracing::{error, info};

/// Create the process-wide shutdown channel.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Flip the channel on SIGINT or SIGTERM.
pub fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            _ = sigterm => info!("terminate received, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}
