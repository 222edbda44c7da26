//shutdown helper shared by the long-running commands
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Returns a token that is cancelled on the first Ctrl-C.
///
/// Must be called from inside a tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            // without a handler the caller still stops on its own deadline
            Err(err) => {
                error!(error = %err, "failed to install Ctrl-C handler");
                return;
            }
        }
        tc.cancel();
    });
    token
}
