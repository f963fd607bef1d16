//! Graceful Shutdown Handler
//!
//! Provides coordinated shutdown for all control-plane tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown coordinator for graceful termination.
///
/// Owns the root cancellation token every long-running task derives its own
/// token from, and tracks open sync sessions so they can drain.
#[derive(Clone)]
pub struct ShutdownController {
    /// Root of the cancellation tree
    token: CancellationToken,
    /// Number of open sync sessions
    active_sessions: Arc<AtomicUsize>,
    /// Notify when all sessions are drained
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// The root token, cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A child token: cancelled on shutdown, cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("initiating graceful shutdown");
            self.token.cancel();
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get the number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    fn session_ended(&self) {
        let prev = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all sessions to drain (with timeout).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let notified = self.drain_complete.notified();
        if self.active_sessions() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} sessions still active",
                    self.active_sessions()
                );
                false
            }
        }
    }

    /// Create a session guard that auto-decrements on drop.
    pub fn session_guard(&self) -> SessionGuard {
        self.session_started();
        SessionGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking an open session.
pub struct SessionGuard {
    controller: ShutdownController,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.controller.session_ended();
    }
}

/// Wait for Ctrl+C or SIGTERM, then shut the controller down.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
        _ = controller.token.cancelled() => {}
    }

    controller.shutdown();
}
