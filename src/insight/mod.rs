//! Liveness / Insight Monitor
//!
//! Tracks which zones (and their ingress and egress gateways) are connected
//! to global. The replica owning a zone's session records a subscription per
//! session and rewrites it every flush interval; the global leader
//! periodically recomputes `online` for every insight so zones owned by a
//! crashed replica still go offline.

mod resyncer;
mod tracker;

pub use resyncer::InsightResyncer;
pub use tracker::{InsightTracker, ZoneSessionInsights};

use crate::domain::value_objects::ResourceType;
use std::time::Duration;

/// Insight timing and history bounds.
#[derive(Debug, Clone)]
pub struct InsightConfig {
    /// How often insights are rewritten (default: 10s)
    pub flush_interval: Duration,
    /// Missed flush intervals before a subscription counts as gone (default: 3)
    pub missed_heartbeat_threshold: u32,
    /// Subscriptions kept per insight (default: 10)
    pub max_subscriptions: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            missed_heartbeat_threshold: 3,
            max_subscriptions: 10,
        }
    }
}

impl InsightConfig {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            ..Default::default()
        }
    }

    pub fn missed_heartbeat_threshold(mut self, threshold: u32) -> Self {
        self.missed_heartbeat_threshold = threshold;
        self
    }

    pub fn max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = max;
        self
    }

    /// Silence after which a subscription is considered gone.
    pub fn timeout(&self) -> Duration {
        self.flush_interval * self.missed_heartbeat_threshold.max(1)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout().as_millis() as u64
    }
}

/// What an insight describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InsightKind {
    Zone,
    ZoneIngress,
    ZoneEgress,
}

impl InsightKind {
    pub const ALL: [InsightKind; 3] = [Self::Zone, Self::ZoneIngress, Self::ZoneEgress];

    /// Resource type the insight is stored as.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Zone => ResourceType::ZoneInsight,
            Self::ZoneIngress => ResourceType::ZoneIngressInsight,
            Self::ZoneEgress => ResourceType::ZoneEgressInsight,
        }
    }

    /// Gateway type the insight tracks, if any.
    pub fn gateway_type(&self) -> Option<ResourceType> {
        match self {
            Self::Zone => None,
            Self::ZoneIngress => Some(ResourceType::ZoneIngress),
            Self::ZoneEgress => Some(ResourceType::ZoneEgress),
        }
    }
}
