//! Meshgate Engine - Keeps device state in sync with the radio network
//!
//! This crate provides the moving parts of the gateway core:
//! - Poller: periodic jobs with jitter over a fixed worker pool
//! - Attribute monitor: binding, reporting and polling fallback per attribute
//! - Enumerator: queued descriptor discovery with per-node exclusion
//! - Capability manager: composition root for capability implementations

pub mod capability;
pub mod enumerator;
pub mod monitor;
pub mod poller;

pub use capability::{
    capability_section, Capability, CapabilityList, CapabilityManager, ManagerConfig, ManagerError,
    CAPABILITY_SECTION, REGISTRY_SECTION,
};
pub use enumerator::{EnumerationError, Enumerator, EnumeratorConfig};
pub use monitor::{
    AttributeMonitor, Attachment, MonitorError, MonitorFactory, MonitorState, PollingConfig,
    PollingMode, ReportingConfig, ReportingMode,
};
pub use poller::{PollHandle, PollTarget, Poller, PollerConfig};
