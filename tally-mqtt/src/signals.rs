//! Process signals: shutdown requests and on-demand snapshots.

use std::future::Future;
use std::io;

/// Resolves on Ctrl-C, or on SIGTERM where available.
///
/// A listener that cannot be registered never fires; it does not count as
/// a shutdown request.
pub async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    () = ctrl_c() => {}
                    () = async {
                        if terminate.recv().await.is_none() {
                            std::future::pending::<()>().await;
                        }
                    } => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    park_on_error("Ctrl-C", tokio::signal::ctrl_c()).await;
}

/// Waits for `listener`; if it fails, logs the error and waits forever.
async fn park_on_error<F>(name: &str, listener: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = listener.await {
        tracing::error!("cannot listen for {name}: {e}");
        std::future::pending::<()>().await;
    }
}

/// SIGUSR1 listener for "export everything now" requests.
///
/// When disabled the signal keeps its default disposition and
/// [`recv`](Self::recv) never resolves.
pub struct SnapshotRequests {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl SnapshotRequests {
    /// Installs the listener if `enabled`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a failed signal registration.
    pub fn install(enabled: bool) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let signal = if enabled {
                tracing::info!("send SIGUSR1 to export statistics and charts");
                Some(signal(SignalKind::user_defined1())?)
            } else {
                None
            };
            Ok(Self { signal })
        }

        #[cfg(not(unix))]
        {
            if enabled {
                tracing::warn!("snapshot requests need SIGUSR1, which this platform lacks");
            }
            Ok(Self {})
        }
    }

    /// Waits for the next request.
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}
