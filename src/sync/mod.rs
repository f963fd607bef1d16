//! Zone <-> global resource synchronization.
//!
//! A zone leader dials the global control plane, performs a handshake and
//! then both sides stream: a full snapshot of every type they are allowed to
//! send, followed by deltas driven by event bus notifications. The store is
//! always re-read before sending, so a lagged listener only costs a resync.

pub mod client;
pub mod codec;
pub mod filter;
pub mod server;
pub mod session;
pub mod syncer;
pub mod transport;
pub mod types;

pub use client::SyncClient;
pub use filter::OutboundFilter;
pub use server::SyncServer;
pub use session::{HeartbeatHook, SessionState, SyncSession};
pub use syncer::{InboundPeer, ResourceSyncer};
pub use transport::{QuicTransport, SyncConnector, SyncStream};
pub use types::{Handshake, Message, ResourceDelta, SyncError};

use std::time::Duration;

/// Redirects a zone follows before giving up on a connection attempt.
pub const MAX_REDIRECTS: usize = 3;

/// Timing of sync sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often each side sends a heartbeat
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered gone
    pub heartbeat_timeout: Duration,
    /// Bound on connect + Hello/Welcome exchange
    pub handshake_timeout: Duration,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn new(heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_interval,
            heartbeat_timeout,
            ..Default::default()
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff_initial = initial;
        self.reconnect_backoff_max = max;
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new(Duration::from_millis(100), Duration::from_millis(500))
            .handshake_timeout(Duration::from_secs(1))
            .backoff(Duration::from_millis(10), Duration::from_millis(80));

        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff_max, Duration::from_millis(80));
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert!(config.heartbeat_timeout > config.heartbeat_interval);
    }
}
