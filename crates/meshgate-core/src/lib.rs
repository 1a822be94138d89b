//! Meshgate Core - Node/device registry, events, and persistence
//!
//! This crate provides the foundational types for the Meshgate gateway:
//! - Node and device model with per-entity locking
//! - Registry owning all node/device state
//! - Gateway event sink
//! - Hierarchical key/value store for persisted state

pub mod device;
pub mod event;
pub mod registry;
pub mod store;

pub use device::{
    Capability, ClusterId, Device, DeviceId, DeviceInfo, Endpoint, EndpointDescriptor,
    EnumerationPermit, IeeeAddress, LogicalType, Node, NodeDescriptor, NodeInfo,
};
pub use event::{Events, GatewayEvent};
pub use registry::{Registry, RegistryError};
pub use store::{Section, Store, StoreError, Value};
