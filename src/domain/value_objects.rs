//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Every resource type known to the control plane.
///
/// The set is closed: type-specific behaviour (scope, sync direction,
/// payload shape) is looked up in the descriptor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Mesh,
    TrafficPermission,
    TrafficRoute,
    Dataplane,
    ZoneIngress,
    ZoneEgress,
    Zone,
    ZoneInsight,
    ZoneIngressInsight,
    ZoneEgressInsight,
    Config,
    Lease,
}

impl ResourceType {
    /// All resource types in registry order.
    pub const ALL: [ResourceType; 12] = [
        ResourceType::Mesh,
        ResourceType::TrafficPermission,
        ResourceType::TrafficRoute,
        ResourceType::Dataplane,
        ResourceType::ZoneIngress,
        ResourceType::ZoneEgress,
        ResourceType::Zone,
        ResourceType::ZoneInsight,
        ResourceType::ZoneIngressInsight,
        ResourceType::ZoneEgressInsight,
        ResourceType::Config,
        ResourceType::Lease,
    ];

    /// Parse a resource type from its string name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mesh => "Mesh",
            Self::TrafficPermission => "TrafficPermission",
            Self::TrafficRoute => "TrafficRoute",
            Self::Dataplane => "Dataplane",
            Self::ZoneIngress => "ZoneIngress",
            Self::ZoneEgress => "ZoneEgress",
            Self::Zone => "Zone",
            Self::ZoneInsight => "ZoneInsight",
            Self::ZoneIngressInsight => "ZoneIngressInsight",
            Self::ZoneEgressInsight => "ZoneEgressInsight",
            Self::Config => "Config",
            Self::Lease => "Lease",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a resource lives at the top level or inside a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Mesh,
}

/// Direction of resource replication between global and a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    GlobalToZone,
    ZoneToGlobal,
}

/// Sync-direction flags declared by a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncFlags {
    pub global_to_zone: bool,
    pub zone_to_global: bool,
}

impl SyncFlags {
    pub const NONE: SyncFlags = SyncFlags {
        global_to_zone: false,
        zone_to_global: false,
    };
    pub const GLOBAL_TO_ZONE: SyncFlags = SyncFlags {
        global_to_zone: true,
        zone_to_global: false,
    };
    pub const ZONE_TO_GLOBAL: SyncFlags = SyncFlags {
        global_to_zone: false,
        zone_to_global: true,
    };
    pub const BOTH: SyncFlags = SyncFlags {
        global_to_zone: true,
        zone_to_global: true,
    };

    /// Check whether the flags permit the given direction.
    pub fn allows(&self, direction: Direction) -> bool {
        match direction {
            Direction::GlobalToZone => self.global_to_zone,
            Direction::ZoneToGlobal => self.zone_to_global,
        }
    }
}

/// Deployment mode of a control-plane instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Global,
    Zone,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "global" => Some(Self::Global),
            "zone" => Some(Self::Zone),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Zone => "zone",
        }
    }

    /// Direction in which this side sends resources.
    pub fn outbound_direction(&self) -> Direction {
        match self {
            Self::Global => Direction::GlobalToZone,
            Self::Zone => Direction::ZoneToGlobal,
        }
    }

    /// Direction in which this side receives resources.
    pub fn inbound_direction(&self) -> Direction {
        match self {
            Self::Global => Direction::ZoneToGlobal,
            Self::Zone => Direction::GlobalToZone,
        }
    }
}

/// Result of applying one remote delta to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    /// Delta was not newer than the stored resource
    Stale,
    /// Delta was not applicable on this side (filtered out)
    Skipped,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Stale => "stale",
            Self::Skipped => "skipped",
        }
    }
}

/// Label keys attached to replicated resources.
pub mod labels {
    /// Which side authored the resource (`global` or `zone`)
    pub const ORIGIN: &str = "sync.mesh/origin";
    /// Zone a resource was received from (global side only)
    pub const ZONE: &str = "sync.mesh/zone";
    /// Version of the resource in the sender's store
    pub const REMOTE_VERSION: &str = "sync.mesh/remote-version";
    /// Identity of the sender's store
    pub const REMOTE_STORE: &str = "sync.mesh/remote-store";

    pub const ORIGIN_GLOBAL: &str = "global";
    pub const ORIGIN_ZONE: &str = "zone";
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
