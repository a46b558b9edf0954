//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running component. When
//! SIGINT/SIGTERM arrives every waiter is notified: the HTTP server stops accepting requests and
//! the runtime unloads its modules within the drain timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::with_timeout(settings.drain_timeout());
//! let server_shutdown = shutdown.clone();
//! tokio::spawn(async move { server_shutdown.wait().await });
//!
//! server::serve(listener, router, shutdown.notified()).await?;
//! runtime.shutdown().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// How long modules get to drain once shutdown starts.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then notify every waiter.
    ///
    /// If a handler cannot be installed that signal is ignored; the other
    /// one still works.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    /// A future resolving once shutdown is triggered, for
    /// `with_graceful_shutdown`-style APIs.
    pub fn notified(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        let triggered = Arc::clone(&self.triggered);
        async move {
            if triggered.load(Ordering::Acquire) {
                return;
            }
            let _ = receiver.recv().await;
        }
    }

    fn notify(&self) {
        self.triggered.store(true, Ordering::Release);
        let _ = self.sender.send(());
    }
}
