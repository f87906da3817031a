use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The engine is stopped by whoever awaits the token; the handler itself only
/// signals. If the Unix handlers cannot be installed, Ctrl-C is still honoured.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let handlers = signal(SignalKind::terminate())
            .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));

        match handlers {
            Ok((mut sigterm, mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signal handlers unavailable, falling back to Ctrl-C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Ctrl-C handler unavailable");
                    return;
                }
                tracing::info!("Received Ctrl-C, initiating graceful shutdown");
            }
        }

        trigger.cancel();
    });

    token
}
