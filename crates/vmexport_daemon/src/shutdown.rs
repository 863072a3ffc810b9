//! Termination signal handling.

use tracing::{info, warn};

/// Resolve when the first SIGINT/SIGTERM arrives. After the first
/// signal a watcher task is left behind so a second interrupt aborts
/// the process instead of waiting out the drain.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received, draining");

    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        warn!("second interrupt, exiting immediately");
        std::process::exit(130);
    });
}
