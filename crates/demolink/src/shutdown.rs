//! Process shutdown signals.

use anyhow::Context;
use tracing::info;

/// Wait for SIGINT or (on unix) SIGTERM.
pub async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to install Ctrl+C handler")?;
                info!("Received SIGINT, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("Received SIGINT, shutting down...");
    }

    Ok(())
}
