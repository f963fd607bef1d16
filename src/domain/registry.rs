//! Resource Type Registry
//!
//! Static descriptors declaring, per resource type, its scope, the
//! directions it may be replicated in, and the payload variant it carries.

use crate::domain::entities::{Resource, ResourceSpec, SpecKind};
use crate::domain::errors::StoreError;
use crate::domain::value_objects::{Direction, ResourceType, Scope, SyncFlags};

/// Static metadata for one resource type. Never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTypeDescriptor {
    pub resource_type: ResourceType,
    pub scope: Scope,
    pub flags: SyncFlags,
    pub spec_kind: SpecKind,
}

const fn descriptor_of(
    resource_type: ResourceType,
    scope: Scope,
    flags: SyncFlags,
    spec_kind: SpecKind,
) -> ResourceTypeDescriptor {
    ResourceTypeDescriptor {
        resource_type,
        scope,
        flags,
        spec_kind,
    }
}

/// Registry order is also the order snapshots are sent in: meshes go first
/// so that mesh-scoped resources find their mesh on the receiving side.
static DESCRIPTORS: [ResourceTypeDescriptor; 12] = [
    descriptor_of(ResourceType::Mesh, Scope::Global, SyncFlags::GLOBAL_TO_ZONE, SpecKind::Mesh),
    descriptor_of(
        ResourceType::TrafficPermission,
        Scope::Mesh,
        SyncFlags::GLOBAL_TO_ZONE,
        SpecKind::Policy,
    ),
    descriptor_of(
        ResourceType::TrafficRoute,
        Scope::Mesh,
        SyncFlags::GLOBAL_TO_ZONE,
        SpecKind::Policy,
    ),
    descriptor_of(
        ResourceType::Dataplane,
        Scope::Mesh,
        SyncFlags::ZONE_TO_GLOBAL,
        SpecKind::Dataplane,
    ),
    descriptor_of(
        ResourceType::ZoneIngress,
        Scope::Global,
        SyncFlags::BOTH,
        SpecKind::ZoneIngress,
    ),
    descriptor_of(
        ResourceType::ZoneEgress,
        Scope::Global,
        SyncFlags::ZONE_TO_GLOBAL,
        SpecKind::ZoneEgress,
    ),
    descriptor_of(ResourceType::Zone, Scope::Global, SyncFlags::NONE, SpecKind::Zone),
    descriptor_of(ResourceType::ZoneInsight, Scope::Global, SyncFlags::NONE, SpecKind::Insight),
    descriptor_of(
        ResourceType::ZoneIngressInsight,
        Scope::Global,
        SyncFlags::NONE,
        SpecKind::Insight,
    ),
    descriptor_of(
        ResourceType::ZoneEgressInsight,
        Scope::Global,
        SyncFlags::NONE,
        SpecKind::Insight,
    ),
    descriptor_of(ResourceType::Config, Scope::Global, SyncFlags::NONE, SpecKind::Config),
    descriptor_of(ResourceType::Lease, Scope::Global, SyncFlags::NONE, SpecKind::Lease),
];

/// Look up the descriptor of a resource type.
pub fn descriptor(resource_type: ResourceType) -> &'static ResourceTypeDescriptor {
    // DESCRIPTORS is indexed in ResourceType::ALL order.
    let index = ResourceType::ALL
        .iter()
        .position(|t| *t == resource_type)
        .unwrap_or(0);
    &DESCRIPTORS[index]
}

/// Resource types permitted to flow in `direction`, in snapshot order.
pub fn types_sent(direction: Direction) -> Vec<ResourceType> {
    DESCRIPTORS
        .iter()
        .filter(|d| d.flags.allows(direction))
        .map(|d| d.resource_type)
        .collect()
}

impl ResourceTypeDescriptor {
    pub fn is_mesh_scoped(&self) -> bool {
        self.scope == Scope::Mesh
    }

    /// Check that the payload variant matches this type.
    pub fn check_spec(&self, spec: &ResourceSpec) -> Result<(), StoreError> {
        if spec.kind() != self.spec_kind {
            return Err(StoreError::Invalid(format!(
                "{} cannot carry a {:?} payload",
                self.resource_type,
                spec.kind()
            )));
        }
        Ok(())
    }

    /// Decode a JSON payload into the variant this type carries.
    pub fn decode_spec(&self, data: &str) -> Result<ResourceSpec, StoreError> {
        let spec: ResourceSpec = serde_json::from_str(data)
            .map_err(|e| StoreError::Invalid(format!("{}: {}", self.resource_type, e)))?;
        self.check_spec(&spec)?;
        Ok(spec)
    }
}

/// Validate scope and payload of a resource before it is written.
pub fn validate(resource: &Resource) -> Result<(), StoreError> {
    let descriptor = descriptor(resource.resource_type);

    match (descriptor.scope, &resource.mesh) {
        (Scope::Global, Some(mesh)) => {
            return Err(StoreError::Invalid(format!(
                "{} is globally scoped but has mesh {}",
                resource.resource_type, mesh
            )));
        }
        (Scope::Mesh, None) => {
            return Err(StoreError::Invalid(format!(
                "{} is mesh scoped but has no mesh",
                resource.resource_type
            )));
        }
        _ => {}
    }

    if resource.name.is_empty() {
        return Err(StoreError::Invalid(format!(
            "{} has an empty name",
            resource.resource_type
        )));
    }

    descriptor.check_spec(&resource.spec)
}
