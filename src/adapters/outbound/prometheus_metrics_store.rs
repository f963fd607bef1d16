//! Prometheus Metrics Store
//!
//! Implements MetricsStore with Prometheus text exposition.

use crate::domain::ports::MetricsStore;
use crate::domain::value_objects::{ApplyOutcome, ResourceType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct AggregatedMetrics {
    /// Sync sessions currently streaming
    pub active_sessions: AtomicI64,
    /// Sync sessions opened since start
    pub sessions_total: AtomicU64,
    /// Lost races on the catalog record
    pub catalog_conflicts: AtomicU64,
}

/// Prometheus-compatible metrics store.
pub struct PrometheusMetricsStore {
    /// Leader gauge per leadership slot
    leaders: DashMap<String, Arc<AtomicBool>>,
    /// Resources sent per type
    sent: DashMap<ResourceType, Arc<AtomicU64>>,
    /// Applied deltas per (type, outcome)
    applied: DashMap<(ResourceType, ApplyOutcome), Arc<AtomicU64>>,
    /// Failed insight flushes per insight type
    flush_failures: DashMap<ResourceType, Arc<AtomicU64>>,
    global: Arc<AggregatedMetrics>,
    /// Instance label for metrics
    instance_id: String,
}

impl PrometheusMetricsStore {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            leaders: DashMap::new(),
            sent: DashMap::new(),
            applied: DashMap::new(),
            flush_failures: DashMap::new(),
            global: Arc::new(AggregatedMetrics::default()),
            instance_id: instance_id.into(),
        }
    }

    /// Get global metrics.
    pub fn global_metrics(&self) -> &AggregatedMetrics {
        &self.global
    }

    /// Number of applied deltas with the given outcome.
    pub fn applied_count(&self, resource_type: ResourceType, outcome: ApplyOutcome) -> u64 {
        self.applied
            .get(&(resource_type, outcome))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of resources sent of the given type.
    pub fn sent_count(&self, resource_type: ResourceType) -> u64 {
        self.sent
            .get(&resource_type)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn counter<K>(map: &DashMap<K, Arc<AtomicU64>>, key: K) -> Arc<AtomicU64>
    where
        K: std::hash::Hash + Eq,
    {
        map.entry(key).or_default().clone()
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP meshsync_leader Leadership per slot (1 leader, 0 follower)\n");
        output.push_str("# TYPE meshsync_leader gauge\n");
        let mut leaders: Vec<(String, bool)> = self
            .leaders
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::SeqCst)))
            .collect();
        leaders.sort();
        for (slot, leader) in leaders {
            output.push_str(&format!(
                "meshsync_leader{{instance=\"{}\",slot=\"{}\"}} {}\n",
                self.instance_id,
                slot,
                if leader { 1 } else { 0 }
            ));
        }

        output.push_str("# HELP meshsync_sessions_active Sync sessions currently streaming\n");
        output.push_str("# TYPE meshsync_sessions_active gauge\n");
        output.push_str(&format!(
            "meshsync_sessions_active{{instance=\"{}\"}} {}\n",
            self.instance_id,
            self.global.active_sessions.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP meshsync_sessions_total Sync sessions opened\n");
        output.push_str("# TYPE meshsync_sessions_total counter\n");
        output.push_str(&format!(
            "meshsync_sessions_total{{instance=\"{}\"}} {}\n",
            self.instance_id,
            self.global.sessions_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP meshsync_resources_sent_total Resources sent to peers\n");
        output.push_str("# TYPE meshsync_resources_sent_total counter\n");
        let mut sent: Vec<(ResourceType, u64)> = self
            .sent
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        sent.sort();
        for (resource_type, count) in sent {
            output.push_str(&format!(
                "meshsync_resources_sent_total{{instance=\"{}\",type=\"{}\"}} {}\n",
                self.instance_id, resource_type, count
            ));
        }

        output.push_str("# HELP meshsync_deltas_applied_total Remote deltas applied by outcome\n");
        output.push_str("# TYPE meshsync_deltas_applied_total counter\n");
        let mut applied: Vec<(ResourceType, &'static str, u64)> = self
            .applied
            .iter()
            .map(|e| (e.key().0, e.key().1.as_str(), e.value().load(Ordering::Relaxed)))
            .collect();
        applied.sort();
        for (resource_type, outcome, count) in applied {
            output.push_str(&format!(
                "meshsync_deltas_applied_total{{instance=\"{}\",type=\"{}\",outcome=\"{}\"}} {}\n",
                self.instance_id, resource_type, outcome, count
            ));
        }

        output.push_str("# HELP meshsync_insight_flush_failures_total Failed insight flushes\n");
        output.push_str("# TYPE meshsync_insight_flush_failures_total counter\n");
        for entry in self.flush_failures.iter() {
            output.push_str(&format!(
                "meshsync_insight_flush_failures_total{{instance=\"{}\",type=\"{}\"}} {}\n",
                self.instance_id,
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        output.push_str("# HELP meshsync_catalog_conflicts_total Lost races on the catalog record\n");
        output.push_str("# TYPE meshsync_catalog_conflicts_total counter\n");
        output.push_str(&format!(
            "meshsync_catalog_conflicts_total{{instance=\"{}\"}} {}\n",
            self.instance_id,
            self.global.catalog_conflicts.load(Ordering::Relaxed)
        ));

        output
    }
}

impl MetricsStore for PrometheusMetricsStore {
    fn set_leader(&self, slot: &str, leader: bool) {
        self.leaders
            .entry(slot.to_string())
            .or_default()
            .store(leader, Ordering::SeqCst);
    }

    fn is_leader(&self, slot: &str) -> bool {
        self.leaders
            .get(slot)
            .map(|g| g.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn session_opened(&self, zone: &str) {
        tracing::debug!("session opened for zone {}", zone);
        self.global.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.global.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    fn session_closed(&self, zone: &str) {
        tracing::debug!("session closed for zone {}", zone);
        self.global.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_sent(&self, resource_type: ResourceType, count: u64) {
        Self::counter(&self.sent, resource_type).fetch_add(count, Ordering::Relaxed);
    }

    fn record_apply(&self, resource_type: ResourceType, outcome: ApplyOutcome) {
        Self::counter(&self.applied, (resource_type, outcome)).fetch_add(1, Ordering::Relaxed);
    }

    fn record_flush_failure(&self, insight_type: ResourceType) {
        Self::counter(&self.flush_failures, insight_type).fetch_add(1, Ordering::Relaxed);
    }

    fn record_catalog_conflict(&self) {
        self.global.catalog_conflicts.fetch_add(1, Ordering::Relaxed);
    }
}
