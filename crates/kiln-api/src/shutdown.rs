//! Process shutdown signalling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install a handler that cancels the returned token on SIGTERM or Ctrl-C.
///
/// The HTTP server and the reaper both watch this token and drain.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate() => info!("Received SIGTERM, initiating graceful shutdown"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            },
        }
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
