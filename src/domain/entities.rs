//! Domain Entities - Core business objects
//!
//! These entities represent the resources replicated between global and
//! zone control planes, together with the records the coordination layer
//! keeps about itself (leases, catalog, connection history).

use crate::domain::value_objects::{labels, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a resource: `(type, mesh, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    /// Owning mesh, `None` for globally scoped types
    pub mesh: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// Key of a globally scoped resource.
    pub fn global(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            mesh: None,
            name: name.into(),
        }
    }

    /// Key of a mesh scoped resource.
    pub fn scoped(
        resource_type: ResourceType,
        mesh: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            mesh: Some(mesh.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mesh {
            Some(mesh) => write!(f, "{}/{}/{}", self.resource_type, mesh, self.name),
            None => write!(f, "{}/{}", self.resource_type, self.name),
        }
    }
}

/// Typed payload of a resource.
///
/// One variant per payload shape; the registry maps each resource type to
/// the variant it must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceSpec {
    Mesh(MeshSpec),
    Policy(PolicySpec),
    Dataplane(DataplaneSpec),
    ZoneIngress(ZoneIngressSpec),
    ZoneEgress(ZoneEgressSpec),
    Zone(ZoneSpec),
    Insight(InsightSpec),
    Config(ConfigSpec),
    Lease(LeaseSpec),
}

/// Discriminant of [`ResourceSpec`] used by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Mesh,
    Policy,
    Dataplane,
    ZoneIngress,
    ZoneEgress,
    Zone,
    Insight,
    Config,
    Lease,
}

impl ResourceSpec {
    pub fn kind(&self) -> SpecKind {
        match self {
            Self::Mesh(_) => SpecKind::Mesh,
            Self::Policy(_) => SpecKind::Policy,
            Self::Dataplane(_) => SpecKind::Dataplane,
            Self::ZoneIngress(_) => SpecKind::ZoneIngress,
            Self::ZoneEgress(_) => SpecKind::ZoneEgress,
            Self::Zone(_) => SpecKind::Zone,
            Self::Insight(_) => SpecKind::Insight,
            Self::Config(_) => SpecKind::Config,
            Self::Lease(_) => SpecKind::Lease,
        }
    }

    pub fn as_insight(&self) -> Option<&InsightSpec> {
        match self {
            Self::Insight(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_lease(&self) -> Option<&LeaseSpec> {
        match self {
            Self::Lease(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_config(&self) -> Option<&ConfigSpec> {
        match self {
            Self::Config(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_zone(&self) -> Option<&ZoneSpec> {
        match self {
            Self::Zone(spec) => Some(spec),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshSpec {
    pub mtls_enabled: bool,
}

/// Payload shared by traffic policies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub conf: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataplaneSpec {
    pub address: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZoneIngressSpec {
    /// Zone the ingress is deployed in
    pub zone: String,
    pub advertised_address: String,
    pub advertised_port: u16,
    pub available_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZoneEgressSpec {
    pub zone: String,
    pub address: String,
    pub port: u16,
}

/// A zone registered at the global control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub enabled: bool,
}

impl Default for ZoneSpec {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Opaque named configuration blob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSpec {
    pub config: String,
}

/// Exclusivity record for one leader slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeaseSpec {
    pub holder_id: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LeaseSpec {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, holder: &str, now: u64) -> bool {
        self.holder_id == holder && !self.is_expired(now)
    }
}

/// One sync-session attempt as recorded in an insight.
///
/// Times are milliseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub generation: u64,
    pub zone: String,
    pub global_instance_id: String,
    pub zone_instance_id: String,
    pub connected_at: u64,
    pub disconnected_at: Option<u64>,
    pub last_heartbeat_at: u64,
    pub control_plane_version: String,
}

impl Subscription {
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }
}

/// Derived connectivity status of a zone, zone ingress or zone egress.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightSpec {
    pub subscriptions: Vec<Subscription>,
    pub online: bool,
}

impl InsightSpec {
    /// Most recent subscription.
    pub fn current(&self) -> Option<&Subscription> {
        self.subscriptions.last()
    }

    /// Compute the online flag at `now`.
    ///
    /// Online iff the current subscription is still connected and its last
    /// heartbeat is younger than `timeout_ms`.
    pub fn compute_online(&self, now: u64, timeout_ms: u64) -> bool {
        match self.current() {
            Some(sub) => {
                sub.is_connected() && now.saturating_sub(sub.last_heartbeat_at) < timeout_ms
            }
            None => false,
        }
    }

    /// Insert or replace a subscription by id, keeping at most `max` entries.
    /// Returns whether the subscription was recorded.
    ///
    /// A subscription seen for the first time gets the next generation. An
    /// unknown subscription that connected before the current one belongs to
    /// a session already dropped from the history and is ignored.
    pub fn upsert_subscription(&mut self, mut subscription: Subscription, max: usize) -> bool {
        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            subscription.generation = existing.generation;
            *existing = subscription;
            return true;
        }

        if self
            .current()
            .is_some_and(|current| subscription.connected_at < current.connected_at)
        {
            return false;
        }

        let next_generation = self
            .subscriptions
            .iter()
            .map(|s| s.generation)
            .max()
            .map(|g| g + 1)
            .unwrap_or(1);
        subscription.generation = next_generation;

        // A newer session supersedes whatever was still open.
        if let Some(previous) = self.subscriptions.last_mut() {
            if previous.disconnected_at.is_none() {
                previous.disconnected_at = Some(subscription.connected_at);
            }
        }

        self.subscriptions.push(subscription);
        let max = max.max(1);
        if self.subscriptions.len() > max {
            let excess = self.subscriptions.len() - max;
            self.subscriptions.drain(..excess);
        }
        true
    }
}

/// A versioned resource as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub mesh: Option<String>,
    pub name: String,
    pub spec: ResourceSpec,
    pub labels: BTreeMap<String, String>,
    /// Store-assigned version, 0 for a resource not yet created
    pub version: u64,
}

impl Resource {
    pub fn new(key: ResourceKey, spec: ResourceSpec) -> Self {
        Self {
            resource_type: key.resource_type,
            mesh: key.mesh,
            name: key.name,
            spec,
            labels: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            resource_type: self.resource_type,
            mesh: self.mesh.clone(),
            name: self.name.clone(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|v| v.as_str())
    }

    /// Version this resource had in the store it was received from.
    pub fn remote_version(&self) -> Option<u64> {
        self.label(labels::REMOTE_VERSION)
            .and_then(|v| v.parse().ok())
    }
}

/// One live replica as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogInstance {
    pub id: String,
    pub address: String,
    pub last_heartbeat: u64,
}

/// Registry of live control-plane replicas.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Catalog {
    pub instances: Vec<CatalogInstance>,
}

impl Catalog {
    /// Name of the config record holding the catalog.
    pub const RECORD_NAME: &'static str = "cp-catalog";

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let instances: Vec<CatalogInstance> = serde_json::from_str(data)?;
        Ok(Self { instances })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.instances)
    }

    /// Insert or refresh an instance entry.
    pub fn upsert(&mut self, instance: CatalogInstance) {
        match self.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
        self.instances.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Drop duplicate ids (keeping the freshest) and entries whose last
    /// heartbeat is older than `max_age_ms`. Returns the number removed.
    pub fn prune(&mut self, now: u64, max_age_ms: u64) -> usize {
        let before = self.instances.len();

        let mut latest: BTreeMap<String, CatalogInstance> = BTreeMap::new();
        for instance in self.instances.drain(..) {
            match latest.get(&instance.id) {
                Some(seen) if seen.last_heartbeat >= instance.last_heartbeat => {}
                _ => {
                    latest.insert(instance.id.clone(), instance);
                }
            }
        }

        self.instances = latest
            .into_values()
            .filter(|i| now.saturating_sub(i.last_heartbeat) <= max_age_ms)
            .collect();

        before - self.instances.len()
    }

    /// Instances whose heartbeat is within `max_age_ms` of `now`.
    pub fn live(&self, now: u64, max_age_ms: u64) -> Vec<CatalogInstance> {
        let mut live: Vec<CatalogInstance> = self
            .instances
            .iter()
            .filter(|i| now.saturating_sub(i.last_heartbeat) <= max_age_ms)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live.dedup_by(|a, b| a.id == b.id);
        live
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn subscription(id: &str, connected_at: u64) -> Subscription {
        Subscription {
            id: id.to_string(),
            generation: 0,
            zone: "zone-1".to_string(),
            global_instance_id: "global-1".to_string(),
            zone_instance_id: "zone-cp-1".to_string(),
            connected_at,
            disconnected_at: None,
            last_heartbeat_at: connected_at,
            control_plane_version: "0.1.0".to_string(),
        }
    }

    fn instance(id: &str, last_heartbeat: u64) -> CatalogInstance {
        CatalogInstance {
            id: id.to_string(),
            address: format!("{}:5685", id),
            last_heartbeat,
        }
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::scoped(ResourceType::Dataplane, "default", "dp-1");
        assert_eq!(key.to_string(), "Dataplane/default/dp-1");

        let key = ResourceKey::global(ResourceType::Mesh, "default");
        assert_eq!(key.to_string(), "Mesh/default");
    }

    #[test]
    fn test_resource_new_has_zero_version() {
        let r = Resource::new(
            ResourceKey::global(ResourceType::Mesh, "default"),
            ResourceSpec::Mesh(MeshSpec::default()),
        );
        assert_eq!(r.version, 0);
        assert_eq!(r.key(), ResourceKey::global(ResourceType::Mesh, "default"));
    }

    #[test]
    fn test_remote_version_label() {
        let r = Resource::new(
            ResourceKey::global(ResourceType::Mesh, "default"),
            ResourceSpec::Mesh(MeshSpec::default()),
        )
        .with_label(labels::REMOTE_VERSION, "42");
        assert_eq!(r.remote_version(), Some(42));
    }

    #[test]
    fn test_lease_expiry() {
        let lease = LeaseSpec {
            holder_id: "a".to_string(),
            acquired_at: 0,
            expires_at: 100,
        };
        assert!(lease.is_held_by("a", 99));
        assert!(!lease.is_held_by("a", 100));
        assert!(!lease.is_held_by("b", 50));
    }

    #[test]
    fn test_insight_online_requires_recent_heartbeat() {
        let mut insight = InsightSpec::default();
        assert!(!insight.compute_online(1000, 100));

        insight.upsert_subscription(subscription("s1", 1000), 10);
        assert!(insight.compute_online(1050, 100));
        assert!(!insight.compute_online(1100, 100));
    }

    #[test]
    fn test_insight_offline_after_disconnect() {
        let mut insight = InsightSpec::default();
        let mut sub = subscription("s1", 1000);
        insight.upsert_subscription(sub.clone(), 10);

        sub.disconnected_at = Some(1010);
        insight.upsert_subscription(sub, 10);

        assert_eq!(insight.subscriptions.len(), 1);
        assert!(!insight.compute_online(1020, 100));
    }

    #[test]
    fn test_insight_generations_increase() {
        let mut insight = InsightSpec::default();
        insight.upsert_subscription(subscription("s1", 1000), 10);
        insight.upsert_subscription(subscription("s2", 2000), 10);

        assert_eq!(insight.subscriptions[0].generation, 1);
        assert_eq!(insight.subscriptions[1].generation, 2);
        // The older open subscription is closed by the newer one
        assert_eq!(insight.subscriptions[0].disconnected_at, Some(2000));
        assert_eq!(insight.current().map(|s| s.id.as_str()), Some("s2"));
    }

    #[test]
    fn test_insight_history_is_bounded() {
        let mut insight = InsightSpec::default();
        for i in 0..5 {
            insight.upsert_subscription(subscription(&format!("s{}", i), i * 10), 3);
        }
        assert_eq!(insight.subscriptions.len(), 3);
        assert_eq!(insight.subscriptions[0].id, "s2");
        assert_eq!(insight.subscriptions[2].generation, 5);
    }

    #[test]
    fn test_evicted_subscription_cannot_become_current() {
        let mut insight = InsightSpec::default();
        insight.upsert_subscription(subscription("old", 1000), 2);
        insight.upsert_subscription(subscription("s1", 2000), 2);
        insight.upsert_subscription(subscription("live", 3000), 2);

        let mut late = subscription("old", 1000);
        late.disconnected_at = Some(3500);
        assert!(!insight.upsert_subscription(late, 2));

        assert_eq!(insight.subscriptions.len(), 2);
        assert_eq!(insight.current().map(|s| s.id.as_str()), Some("live"));
        assert!(insight.compute_online(3050, 100));
    }

    #[test]
    fn test_catalog_upsert_replaces_entry() {
        let mut catalog = Catalog::default();
        catalog.upsert(instance("b", 1));
        catalog.upsert(instance("a", 1));
        catalog.upsert(instance("b", 5));

        assert_eq!(catalog.instances.len(), 2);
        assert_eq!(catalog.instances[0].id, "a");
        assert_eq!(catalog.instances[1].last_heartbeat, 5);
    }

    #[test]
    fn test_catalog_prune_removes_stale_and_duplicates() {
        let mut catalog = Catalog {
            instances: vec![
                instance("a", 100),
                instance("a", 900),
                instance("b", 950),
                instance("c", 10),
            ],
        };

        let removed = catalog.prune(1000, 200);
        assert_eq!(removed, 2);
        assert_eq!(catalog.instances, vec![instance("a", 900), instance("b", 950)]);
    }

    #[test]
    fn test_catalog_json_format() {
        let catalog = Catalog {
            instances: vec![instance("a", 7)],
        };
        let json = catalog.to_json().unwrap();
        assert_eq!(json, r#"[{"id":"a","address":"a:5685","lastHeartbeat":7}]"#);
        assert_eq!(Catalog::from_json(&json).unwrap(), catalog);
        assert_eq!(Catalog::from_json("").unwrap(), Catalog::default());
    }

    #[test]
    fn test_catalog_live_filters_stale() {
        let catalog = Catalog {
            instances: vec![instance("b", 990), instance("a", 100)],
        };
        let live = catalog.live(1000, 50);
        assert_eq!(live, vec![instance("b", 990)]);
    }
}
