use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either signal arrives. The node
/// stops accepting starts, terminates its executors and exits.
///
/// # Errors
///
/// Fails if the signal streams cannot be registered.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, terminating executors");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, terminating executors");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
