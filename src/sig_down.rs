//! Graceful shutdown plumbing.
//!
//! A single [`CancellationToken`] is distributed to every subsystem (scans,
//! sweeps, watches, SSE loops). On SIGTERM/SIGINT the token is cancelled, the
//! HTTP listeners stop accepting, and background tasks get a bounded window
//! to drain before the store closes. In-flight tx-state rows are left in
//! place for the reconciler on next boot.

use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The longest acceptable sweep; background tasks past this are abandoned.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Handles graceful shutdown on SIGTERM and SIGINT signals.
pub struct SigDown {
    signal_task: TaskTracker,
    background: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers.
    ///
    /// Returns an error if signal registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let inner = CancellationToken::new();
        let outer = inner.clone();
        let signal_task = TaskTracker::new();
        signal_task.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    inner.cancel();
                },
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    inner.cancel();
                }
            }
        });
        signal_task.close();
        Ok(Self {
            signal_task,
            background: TaskTracker::new(),
            cancellation_token: outer,
        })
    }

    /// Returns a clone of the cancellation token for distributing to subsystems.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// The tracker long-lived background tasks must be spawned on so that
    /// shutdown can wait for them.
    pub fn tracker(&self) -> &TaskTracker {
        &self.background
    }

    /// Waits for cancellation, then for background tasks to drain, bounded by
    /// [`DRAIN_TIMEOUT`].
    pub async fn drain(&self) {
        self.cancellation_token.cancelled().await;
        self.signal_task.wait().await;
        self.background.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.background.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "background tasks did not drain in time, abandoning"
            );
        }
    }
}
