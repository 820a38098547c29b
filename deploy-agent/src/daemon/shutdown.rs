//! Graceful stop on SIGTERM or SIGINT.
//!
//! In-flight requests finish before the listener closes; there is no
//! mid-transfer resume, so an interrupted upload is retried by the client.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::error;

/// How long in-flight requests may drain after a stop signal
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves with the signal name once SIGINT or SIGTERM arrives.
pub async fn stop_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

/// One-way switch the server's graceful-shutdown future waits on.
pub struct StopSwitch {
    tx: watch::Sender<bool>,
}

impl StopSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Completes once `stop` has been called, even if that was earlier.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

impl Default for StopSwitch {
    fn default() -> Self {
        Self::new()
    }
}
