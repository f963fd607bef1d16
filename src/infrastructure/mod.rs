//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod backoff;
pub mod event_bus;
pub mod shutdown;

pub use backoff::Backoff;
pub use event_bus::{BusEvent, EventBus, Listener, Operation, ResourceChangedEvent};
pub use shutdown::{shutdown_signal, SessionGuard, ShutdownController};
