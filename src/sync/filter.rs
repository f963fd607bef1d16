//! Outbound filtering: which local resources a session may send.

use super::types::ResourceDelta;
use crate::domain::entities::Resource;
use crate::domain::registry;
use crate::domain::value_objects::{labels, Direction, ResourceType};

/// Sending side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFilter {
    /// Global sending to the zone `zone`
    ToZone { zone: String },
    /// Zone sending to global
    ToGlobal,
}

impl OutboundFilter {
    pub fn direction(&self) -> Direction {
        match self {
            Self::ToZone { .. } => Direction::GlobalToZone,
            Self::ToGlobal => Direction::ZoneToGlobal,
        }
    }

    /// Types this side sends, in snapshot order.
    pub fn types(&self) -> Vec<ResourceType> {
        registry::types_sent(self.direction())
    }

    /// Whether `resource` may be sent. `mesh_known` tells whether the mesh of
    /// a mesh-scoped resource exists locally.
    pub fn admits(&self, resource: &Resource, mesh_known: bool) -> bool {
        let descriptor = registry::descriptor(resource.resource_type);
        if !descriptor.flags.allows(self.direction()) {
            return false;
        }
        if descriptor.is_mesh_scoped() && !mesh_known {
            return false;
        }

        match self {
            // Never hand a zone its own resources back
            Self::ToZone { zone } => resource.label(labels::ZONE) != Some(zone.as_str()),
            // Only locally originated resources go up
            Self::ToGlobal => resource.label(labels::ORIGIN) != Some(labels::ORIGIN_GLOBAL),
        }
    }

    pub fn delta(&self, resource: &Resource) -> ResourceDelta {
        ResourceDelta::from_resource(resource)
    }
}
