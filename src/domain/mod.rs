//! Domain layer: resources, descriptors and the ports the rest of the
//! control plane is written against.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod registry;
pub mod value_objects;
