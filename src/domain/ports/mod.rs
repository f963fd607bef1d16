mod metrics_store;
mod resource_store;

pub use metrics_store::MetricsStore;
pub use resource_store::ResourceStore;
