use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGTERM or SIGINT.
///
/// If a handler cannot be installed the failure is logged and the remaining
/// signal still triggers shutdown; with neither available the token is only
/// cancelled by its other owners.
pub fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                None
            }
        };

        tokio::select! {
            Some(_) = recv(&mut sigterm) => {
                tracing::info!("Received SIGTERM, shutting down dispatcher");
            }
            Some(_) = recv(&mut sigint) => {
                tracing::info!("Received SIGINT, shutting down dispatcher");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });
}

async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}
