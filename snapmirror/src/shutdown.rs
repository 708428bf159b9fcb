//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels the run token. The step in flight stops at its
//! next stage boundary (an rsync child is killed), so the staged snapshot
//! stays writable and is resumed by the next run.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Watch for signals in the background.
    pub fn listen(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => token.cancel(),
                _ = token.cancelled() => {}
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), stopping after the current stage");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping after the current stage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled() {
        let coordinator = ShutdownCoordinator::new();
        let listener = coordinator.listen();

        assert!(!coordinator.is_shutdown());
        coordinator.token().cancel();

        listener.await.unwrap();
        assert!(coordinator.is_shutdown());
    }
}
