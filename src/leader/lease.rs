//! Lease records
//!
//! Acquire, renew and release the lease of one leader slot. Every write is
//! an optimistic-concurrency update, so two replicas racing for an expired
//! lease cannot both win.

use crate::domain::entities::{LeaseSpec, Resource, ResourceKey, ResourceSpec};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::value_objects::ResourceType;
use std::sync::Arc;
use std::time::Duration;

/// Key of the lease record for a slot.
pub fn lease_key(slot: &str) -> ResourceKey {
    ResourceKey::global(ResourceType::Lease, slot)
}

/// What to do with a lease, given its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease yet
    Create,
    /// We hold it; extend it
    Renew,
    /// Someone else held it but it expired
    TakeOver,
    /// Someone else holds a live lease
    Denied { holder: String, expires_at: u64 },
}

impl LeaseDecision {
    /// Decide how `holder` may treat `existing` at `now`.
    pub fn decide(existing: Option<&LeaseSpec>, holder: &str, now: u64) -> Self {
        match existing {
            None => Self::Create,
            Some(lease) if lease.holder_id == holder => Self::Renew,
            Some(lease) if lease.is_expired(now) => Self::TakeOver,
            Some(lease) => Self::Denied {
                holder: lease.holder_id.clone(),
                expires_at: lease.expires_at,
            },
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    Renewed,
    HeldByOther { holder: String, expires_at: u64 },
}

impl LeaseOutcome {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Acquired | Self::Renewed)
    }
}

/// Lease operations of one replica on one slot.
pub struct LeaseClient {
    store: Arc<dyn ResourceStore>,
    slot: String,
    holder: String,
    ttl: Duration,
}

impl LeaseClient {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        slot: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            slot: slot.into(),
            holder: holder.into(),
            ttl,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Read the current lease.
    pub async fn current(&self) -> Result<Option<LeaseSpec>, StoreError> {
        let resource = self.store.get(&lease_key(&self.slot)).await?;
        Ok(resource.and_then(|r| r.spec.as_lease().cloned()))
    }

    /// Whether this replica holds a live lease at `now`, as recorded in the store.
    pub async fn is_held_by_self(&self, now: u64) -> Result<bool, StoreError> {
        Ok(self
            .current()
            .await?
            .map(|lease| lease.is_held_by(&self.holder, now))
            .unwrap_or(false))
    }

    /// Try to acquire or renew the lease at `now`.
    pub async fn try_acquire(&self, now: u64) -> Result<LeaseOutcome, StoreError> {
        let key = lease_key(&self.slot);
        let existing = self.store.get(&key).await?;
        let existing_spec: Option<LeaseSpec> =
            existing.as_ref().and_then(|r| r.spec.as_lease().cloned());
        let expires_at = now + self.ttl.as_millis() as u64;

        let result = match LeaseDecision::decide(existing_spec.as_ref(), &self.holder, now) {
            LeaseDecision::Denied { holder, expires_at } => {
                return Ok(LeaseOutcome::HeldByOther { holder, expires_at });
            }
            LeaseDecision::Create => {
                let lease = Resource::new(
                    key,
                    ResourceSpec::Lease(LeaseSpec {
                        holder_id: self.holder.clone(),
                        acquired_at: now,
                        expires_at,
                    }),
                );
                self.store.create(lease).await.map(|_| LeaseOutcome::Acquired)
            }
            LeaseDecision::Renew | LeaseDecision::TakeOver => {
                let Some(mut resource) = existing else {
                    return Err(StoreError::NotFound(key.to_string()));
                };
                let renewing = existing_spec
                    .as_ref()
                    .map(|l| l.holder_id == self.holder && !l.is_expired(now))
                    .unwrap_or(false);
                let acquired_at = match &existing_spec {
                    Some(l) if renewing => l.acquired_at,
                    _ => now,
                };
                resource.spec = ResourceSpec::Lease(LeaseSpec {
                    holder_id: self.holder.clone(),
                    acquired_at,
                    expires_at,
                });
                self.store.update(resource).await.map(|_| {
                    if renewing {
                        LeaseOutcome::Renewed
                    } else {
                        LeaseOutcome::Acquired
                    }
                })
            }
        };

        match result {
            Err(e) if e.is_conflict() => {
                tracing::debug!("lease {} contended: {}", self.slot, e);
                match self.current().await? {
                    Some(lease) if lease.holder_id != self.holder => Ok(LeaseOutcome::HeldByOther {
                        holder: lease.holder_id,
                        expires_at: lease.expires_at,
                    }),
                    _ => Err(e),
                }
            }
            other => other,
        }
    }

    /// Give the lease up so a standby can take over without waiting for expiry.
    pub async fn release(&self, now: u64) -> Result<(), StoreError> {
        let Some(mut resource) = self.store.get(&lease_key(&self.slot)).await? else {
            return Ok(());
        };
        match resource.spec.as_lease() {
            Some(lease) if lease.is_held_by(&self.holder, now) => {
                resource.spec = ResourceSpec::Lease(LeaseSpec {
                    holder_id: lease.holder_id.clone(),
                    acquired_at: lease.acquired_at,
                    expires_at: now,
                });
                self.store.update(resource).await?;
                tracing::info!("released lease {}", self.slot);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
