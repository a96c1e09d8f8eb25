use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Process-wide shutdown flag for long waits that should give up when the bot exits.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so this only returns once the flag flips.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleeps for `duration`. Returns `false` if shutdown started first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.triggered() => false,
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_cut_short() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });
        let started = std::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
        // Already triggered: returns immediately.
        shutdown.triggered().await;
    }
}
