mod evented_resource_store;
mod memory_resource_store;
mod prometheus_metrics_store;
mod sqlite_resource_store;

pub use evented_resource_store::EventedResourceStore;
pub use memory_resource_store::MemoryResourceStore;
pub use prometheus_metrics_store::{AggregatedMetrics, PrometheusMetricsStore};
pub use sqlite_resource_store::SqliteResourceStore;
