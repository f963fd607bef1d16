//! Leader Election
//!
//! Lease-based single-leader selection among replicas of one logical
//! control-plane instance, backed by the resource store.

mod elector;
mod lease;

pub use elector::{
    ElectionState, LeaderComponent, LeaderContext, LeaderElector, Leadership,
};
pub use lease::{lease_key, LeaseClient, LeaseDecision, LeaseOutcome};

use std::time::Duration;

/// Timing of one leader slot.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Lifetime of a lease write (default: 15s)
    pub lease_ttl: Duration,
    /// Renewal cadence, strictly shorter than the TTL (default: 5s)
    pub renew_interval: Duration,
    /// How long demoted leader work may take to stop (default: 2s)
    pub grace_period: Duration,
    /// Upper bound on a single store call (default: 3s)
    pub store_timeout: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            store_timeout: Duration::from_secs(3),
        }
    }
}

impl LeaderConfig {
    pub fn new(lease_ttl: Duration, renew_interval: Duration) -> Self {
        Self {
            lease_ttl,
            renew_interval,
            ..Default::default()
        }
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// A failed renewal plus the demotion grace must end before the lease
    /// can expire, so leader work never outlives the lease.
    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.renew_interval.is_zero() || self.lease_ttl.is_zero() {
            return Err(ElectionError::InvalidTiming(
                "lease ttl and renew interval must be non-zero".to_string(),
            ));
        }
        if self.renew_interval + self.store_timeout + self.grace_period >= self.lease_ttl {
            return Err(ElectionError::InvalidTiming(format!(
                "renew interval {:?} + store timeout {:?} + grace period {:?} \
                 must be shorter than lease ttl {:?}",
                self.renew_interval, self.store_timeout, self.grace_period, self.lease_ttl
            )));
        }
        Ok(())
    }
}

/// Leader election errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ElectionError {
    #[error("invalid leader timing: {0}")]
    InvalidTiming(String),
    #[error("lease {slot} lost to {holder}")]
    LeaseLost { slot: String, holder: String },
}
