//! mesh-sync Library
//!
//! Control-plane synchronization core for a multi-zone service mesh: a
//! resource store with change events, lease-based leader election, an
//! instance catalog, bidirectional zone/global resource sync and zone
//! liveness tracking.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod insight;
pub mod leader;
pub mod sync;

// Re-export commonly used types
pub use application::ControlPlane;
pub use config::{load_config, Config};
pub use domain::entities::{Resource, ResourceKey, ResourceSpec};
pub use domain::errors::StoreError;
pub use domain::ports::{MetricsStore, ResourceStore};
pub use domain::value_objects::{Mode, ResourceType};
pub use infrastructure::{EventBus, ShutdownController};
pub use leader::{LeaderComponent, LeaderElector};
pub use sync::{SyncClient, SyncServer};
