//! Resource Event Bus
//!
//! In-process publish/subscribe of resource-change notifications.
//!
//! Every listener owns a bounded buffer. Publishing never blocks: when a
//! listener's buffer is full the event is dropped for that listener and the
//! listener is marked lagged. Its next receive yields [`BusEvent::Lagged`],
//! telling the consumer to re-read the store. Events only carry keys and
//! versions; the store stays the record of truth.

use crate::domain::entities::ResourceKey;
use crate::domain::value_objects::ResourceType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-listener buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Kind of write that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Notification that a resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChangedEvent {
    pub operation: Operation,
    pub key: ResourceKey,
    /// Version after the write (the deletion revision for deletes)
    pub version: u64,
}

impl ResourceChangedEvent {
    pub fn resource_type(&self) -> ResourceType {
        self.key.resource_type
    }
}

/// What a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Changed(ResourceChangedEvent),
    /// Events were dropped; re-read the store.
    Lagged,
}

type Predicate = Arc<dyn Fn(&ResourceChangedEvent) -> bool + Send + Sync>;

struct ListenerSlot {
    tx: mpsc::Sender<ResourceChangedEvent>,
    lagged: Arc<AtomicBool>,
    predicate: Predicate,
}

/// Process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<ListenerSlot>>>,
    buffer_size: usize,
}

impl EventBus {
    /// Create a bus whose listeners buffer up to `buffer_size` events.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Subscribe to events matching `predicate`.
    pub fn subscribe<F>(&self, predicate: F) -> Listener
    where
        F: Fn(&ResourceChangedEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let lagged = Arc::new(AtomicBool::new(false));

        self.listeners.lock().push(ListenerSlot {
            tx,
            lagged: lagged.clone(),
            predicate: Arc::new(predicate),
        });

        Listener { rx, lagged }
    }

    /// Subscribe to all events for the given resource types.
    pub fn subscribe_types(&self, types: Vec<ResourceType>) -> Listener {
        self.subscribe(move |event| types.contains(&event.resource_type()))
    }

    /// Publish an event to every interested listener without blocking.
    pub fn publish(&self, event: ResourceChangedEvent) {
        let mut listeners = self.listeners.lock();

        listeners.retain(|slot| {
            if !(slot.predicate)(&event) {
                return !slot.tx.is_closed();
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    if !slot.lagged.swap(true, Ordering::SeqCst) {
                        tracing::debug!("event bus listener lagged, dropping {}", event.key);
                    }
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of registered listeners (closed ones are pruned on publish).
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Receiving end of a subscription.
pub struct Listener {
    rx: mpsc::Receiver<ResourceChangedEvent>,
    lagged: Arc<AtomicBool>,
}

impl Listener {
    /// Receive the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        if let Some(lagged) = self.take_lagged() {
            return Some(lagged);
        }
        let event = self.rx.recv().await?;
        if let Some(lagged) = self.take_lagged() {
            return Some(lagged);
        }
        Some(BusEvent::Changed(event))
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        if let Some(lagged) = self.take_lagged() {
            return Some(lagged);
        }
        self.rx.try_recv().ok().map(BusEvent::Changed)
    }

    /// Buffered events are superseded by the resync a lag forces.
    fn take_lagged(&mut self) -> Option<BusEvent> {
        if self.lagged.swap(false, Ordering::SeqCst) {
            while self.rx.try_recv().is_ok() {}
            return Some(BusEvent::Lagged);
        }
        None
    }
}
