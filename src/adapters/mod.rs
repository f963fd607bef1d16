//! Adapters: inbound (HTTP status surface) and outbound (stores, metrics).

pub mod inbound;
pub mod outbound;
