//! Sync Types
//!
//! Wire messages exchanged on a zone <-> global sync stream, and the errors
//! a session can end with.

use crate::domain::entities::{Resource, ResourceSpec};
use crate::domain::errors::StoreError;
use crate::domain::value_objects::{labels, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version string advertised in the handshake.
pub const CONTROL_PLANE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// First message of a session, sent by the zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub zone: String,
    pub instance_id: String,
    pub version: String,
    /// Identity of the zone's store
    pub store_id: String,
}

/// One resource change, or a tombstone when `spec` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub resource_type: ResourceType,
    pub mesh: Option<String>,
    pub name: String,
    /// Version in the sender's store
    pub version: u64,
    pub labels: BTreeMap<String, String>,
    pub spec: Option<ResourceSpec>,
}

impl ResourceDelta {
    /// Delta carrying a resource, without sync bookkeeping labels.
    pub fn from_resource(resource: &Resource) -> Self {
        let labels = resource
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != labels::REMOTE_VERSION && k.as_str() != labels::REMOTE_STORE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            resource_type: resource.resource_type,
            mesh: resource.mesh.clone(),
            name: resource.name.clone(),
            version: resource.version,
            labels,
            spec: Some(resource.spec.clone()),
        }
    }

    pub fn tombstone(
        resource_type: ResourceType,
        mesh: Option<String>,
        name: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            resource_type,
            mesh,
            name: name.into(),
            version,
            labels: BTreeMap::new(),
            spec: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.spec.is_none()
    }
}

/// Messages exchanged on a sync stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Zone -> global: open a session
    Hello(Handshake),
    /// Global -> zone: session accepted
    Welcome {
        global_instance_id: String,
        store_id: String,
    },
    /// Global -> zone: connect to another replica instead
    Redirect { instance_id: String, address: String },
    /// Global -> zone: session refused
    Reject { reason: String },
    /// Full state of one resource type
    Snapshot {
        resource_type: ResourceType,
        resources: Vec<ResourceDelta>,
    },
    Delta(ResourceDelta),
    Heartbeat { sent_at: u64 },
    /// Graceful close
    Goodbye,
}

/// Get the message type as a string.
pub fn message_type_name(msg: &Message) -> &'static str {
    match msg {
        Message::Hello(_) => "Hello",
        Message::Welcome { .. } => "Welcome",
        Message::Redirect { .. } => "Redirect",
        Message::Reject { .. } => "Reject",
        Message::Snapshot { .. } => "Snapshot",
        Message::Delta(_) => "Delta",
        Message::Heartbeat { .. } => "Heartbeat",
        Message::Goodbye => "Goodbye",
    }
}

/// Why a sync session ended.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("too many redirects (last target {0})")]
    TooManyRedirects(String),

    #[error("no heartbeat from peer within {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
