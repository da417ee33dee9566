//! Shutdown coordination.
//!
//! [`Shutdown`] turns SIGTERM/SIGINT (Ctrl+C on Windows) into a [`CancellationToken`]
//! shared by the HTTP server and the webhook notifier. The server stops accepting
//! connections when the token fires, then queued webhook deliveries get a bounded
//! window to finish.

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cancels a shared token when the process is asked to stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    listener: TaskTracker,
}

impl Shutdown {
    /// Creates a coordinator that only fires when [`Shutdown::trigger`] is called.
    #[must_use]
    pub fn manual() -> Self {
        let listener = TaskTracker::new();
        listener.close();
        Self {
            token: CancellationToken::new(),
            listener,
        }
    }

    /// Installs OS signal handlers.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::Error`] if a signal handler cannot be registered.
    #[allow(clippy::unnecessary_wraps)] // only fallible on unix
    pub fn listen() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let listener = TaskTracker::new();
        let on_signal = token.clone();

        #[cfg(unix)]
        {
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            listener.spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                    () = on_signal.cancelled() => return,
                }
                on_signal.cancel();
            });
        }

        #[cfg(windows)]
        {
            listener.spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down"),
                    () = on_signal.cancelled() => return,
                }
                on_signal.cancel();
            });
        }

        listener.close();
        Ok(Self { token, listener })
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Starts shutdown without a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has started and the signal listener has exited.
    pub async fn wait(&self) {
        self.token.cancelled().await;
        self.listener.wait().await;
    }
}
