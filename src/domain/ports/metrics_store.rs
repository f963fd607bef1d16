//! Metrics Store Port
//!
//! Defines the interface for recording coordination and sync metrics.

use crate::domain::value_objects::{ApplyOutcome, ResourceType};

/// Store for runtime metrics.
///
/// This is an outbound port. The leader gauge is the externally visible
/// leadership signal: `1` for the current leader of a slot, `0` otherwise.
pub trait MetricsStore: Send + Sync {
    /// Set the leadership gauge of a slot.
    fn set_leader(&self, slot: &str, leader: bool);

    /// Read back the leadership gauge of a slot.
    fn is_leader(&self, slot: &str) -> bool;

    /// A sync session with a zone reached the streaming state.
    fn session_opened(&self, zone: &str);

    /// A sync session with a zone ended.
    fn session_closed(&self, zone: &str);

    /// Record a delta or snapshot entry sent to a peer.
    fn record_sent(&self, resource_type: ResourceType, count: u64);

    /// Record the outcome of applying a remote delta.
    fn record_apply(&self, resource_type: ResourceType, outcome: ApplyOutcome);

    /// Record an insight flush that failed and will be retried.
    fn record_flush_failure(&self, insight_type: ResourceType);

    /// Record a lost optimistic-concurrency race on the catalog record.
    fn record_catalog_conflict(&self);
}
