//! Resource Syncer
//!
//! Applies deltas and snapshots received from a peer to the local store.
//! The peer is authoritative for the types it sends: an incoming resource
//! overwrites the local one with the same key, unless it is not newer than
//! what was already received from the same peer store (`Stale`).

use super::types::ResourceDelta;
use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::registry;
use crate::domain::value_objects::{labels, ApplyOutcome, Direction, ResourceType};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Optimistic-concurrency retries per delta.
const MAX_APPLY_ATTEMPTS: usize = 5;

/// Who the deltas come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPeer {
    /// Global receiving from the zone `zone`
    Zone { zone: String },
    /// Zone `local_zone` receiving from global
    Global { local_zone: String },
}

impl InboundPeer {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Zone { .. } => Direction::ZoneToGlobal,
            Self::Global { .. } => Direction::GlobalToZone,
        }
    }

    /// Local name of a resource named `name` on the peer.
    pub fn local_name(&self, name: &str) -> String {
        match self {
            Self::Zone { zone } => format!("{}.{}", zone, name),
            Self::Global { .. } => name.to_string(),
        }
    }

    /// Whether a local resource was received from this peer.
    pub fn owns(&self, resource: &Resource) -> bool {
        match self {
            Self::Zone { zone } => {
                resource.label(labels::ZONE) == Some(zone.as_str())
                    && resource.label(labels::ORIGIN) == Some(labels::ORIGIN_ZONE)
            }
            Self::Global { .. } => resource.label(labels::ORIGIN) == Some(labels::ORIGIN_GLOBAL),
        }
    }

    fn stamp(&self, resource: &mut Resource) {
        match self {
            Self::Zone { zone } => {
                resource.labels.insert(labels::ZONE.to_string(), zone.clone());
                resource
                    .labels
                    .insert(labels::ORIGIN.to_string(), labels::ORIGIN_ZONE.to_string());
            }
            Self::Global { .. } => {
                resource
                    .labels
                    .insert(labels::ORIGIN.to_string(), labels::ORIGIN_GLOBAL.to_string());
            }
        }
    }
}

/// Applies what one peer sends.
pub struct ResourceSyncer {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<dyn MetricsStore>,
    peer: InboundPeer,
    /// Store identity of the peer, from the handshake
    remote_store: String,
}

impl ResourceSyncer {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsStore>,
        peer: InboundPeer,
        remote_store: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metrics,
            peer,
            remote_store: remote_store.into(),
        }
    }

    pub fn peer(&self) -> &InboundPeer {
        &self.peer
    }

    /// Apply one delta and record its outcome.
    pub async fn apply_delta(&self, delta: &ResourceDelta) -> Result<ApplyOutcome, StoreError> {
        let outcome = self.apply(delta).await?;
        self.metrics.record_apply(delta.resource_type, outcome);
        tracing::debug!(
            "applied {} {}/{} v{}: {}",
            delta.resource_type,
            delta.mesh.as_deref().unwrap_or("-"),
            delta.name,
            delta.version,
            outcome.as_str()
        );
        Ok(outcome)
    }

    /// Apply a full snapshot of `resource_type`, then delete what this peer
    /// sent earlier but no longer has.
    pub async fn apply_snapshot(
        &self,
        resource_type: ResourceType,
        deltas: &[ResourceDelta],
    ) -> Result<Vec<ApplyOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(deltas.len());
        let mut present: BTreeSet<(Option<String>, String)> = BTreeSet::new();

        for delta in deltas.iter().filter(|d| d.resource_type == resource_type) {
            present.insert((delta.mesh.clone(), self.peer.local_name(&delta.name)));
            outcomes.push(self.apply_delta(delta).await?);
        }

        if !registry::descriptor(resource_type).flags.allows(self.peer.direction()) {
            return Ok(outcomes);
        }

        let mut removed = 0;
        for resource in self.store.list(resource_type, None).await? {
            if !self.peer.owns(&resource)
                || present.contains(&(resource.mesh.clone(), resource.name.clone()))
            {
                continue;
            }
            match self.store.delete(&resource.key()).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    removed += 1;
                    self.metrics.record_apply(resource_type, ApplyOutcome::Deleted);
                    outcomes.push(ApplyOutcome::Deleted);
                }
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            tracing::info!(
                "snapshot of {} removed {} resources no longer present on peer",
                resource_type,
                removed
            );
        }

        Ok(outcomes)
    }

    async fn apply(&self, delta: &ResourceDelta) -> Result<ApplyOutcome, StoreError> {
        let descriptor = registry::descriptor(delta.resource_type);
        if !descriptor.flags.allows(self.peer.direction()) {
            return Ok(ApplyOutcome::Skipped);
        }

        if let InboundPeer::Global { local_zone } = &self.peer {
            // Our own ingress coming back around
            if delta.labels.get(labels::ZONE) == Some(local_zone) {
                return Ok(ApplyOutcome::Skipped);
            }
        }

        if descriptor.is_mesh_scoped() && !delta.is_tombstone() {
            let Some(mesh) = &delta.mesh else {
                return Ok(ApplyOutcome::Skipped);
            };
            let mesh_key = ResourceKey::global(ResourceType::Mesh, mesh.clone());
            if self.store.get(&mesh_key).await?.is_none() {
                return Ok(ApplyOutcome::Skipped);
            }
        }

        let key = ResourceKey {
            resource_type: delta.resource_type,
            mesh: delta.mesh.clone(),
            name: self.peer.local_name(&delta.name),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_apply(&key, delta).await {
                Err(e) if e.is_conflict() && attempt < MAX_APPLY_ATTEMPTS => {
                    tracing::debug!("conflict applying {}, retrying: {}", key, e);
                }
                other => return other,
            }
        }
    }

    async fn try_apply(
        &self,
        key: &ResourceKey,
        delta: &ResourceDelta,
    ) -> Result<ApplyOutcome, StoreError> {
        let existing = self.store.get(key).await?;

        if let Some(existing) = &existing {
            if self.is_stale(existing, delta.version) {
                return Ok(ApplyOutcome::Stale);
            }
        }

        let Some(spec) = &delta.spec else {
            return match existing {
                Some(existing) if self.peer.owns(&existing) => {
                    match self.store.delete(key).await {
                        Ok(_) | Err(StoreError::NotFound(_)) => Ok(ApplyOutcome::Deleted),
                        Err(e) => Err(e),
                    }
                }
                _ => Ok(ApplyOutcome::Skipped),
            };
        };

        let mut resource = Resource::new(key.clone(), spec.clone());
        resource.labels = delta.labels.clone();
        self.peer.stamp(&mut resource);
        resource
            .labels
            .insert(labels::REMOTE_STORE.to_string(), self.remote_store.clone());
        resource
            .labels
            .insert(labels::REMOTE_VERSION.to_string(), delta.version.to_string());

        match existing {
            Some(existing) => {
                resource.version = existing.version;
                self.store.update(resource).await?;
                Ok(ApplyOutcome::Updated)
            }
            None => {
                self.store.create(resource).await?;
                Ok(ApplyOutcome::Created)
            }
        }
    }

    /// Not newer than what we already hold from the same peer store.
    fn is_stale(&self, existing: &Resource, version: u64) -> bool {
        existing.label(labels::REMOTE_STORE) == Some(self.remote_store.as_str())
            && existing
                .remote_version()
                .map(|applied| version <= applied)
                .unwrap_or(false)
    }
}
