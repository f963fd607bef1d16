//! Application Layer
//!
//! Wires domain, adapters and background components into a running replica.

mod control_plane;

pub use control_plane::ControlPlane;
