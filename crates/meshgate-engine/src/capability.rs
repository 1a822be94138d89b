//! Capabilities and the manager that wires them to the gateway core
//!
//! The [`CapabilityManager`] owns the registry, transport, router, poller and
//! enumerator and exposes them to capability implementations. It also
//! implements the two capabilities every device carries: re-enumeration and
//! removal.

use async_trait::async_trait;
use meshgate_core::{
    Capability as CapabilityTag, Device, DeviceId, Endpoint, Events, GatewayEvent, IeeeAddress,
    Node, Registry, RegistryError, Section, Store,
};
use meshgate_zcl::types::DEFAULT_GATEWAY_ENDPOINT;
use meshgate_zcl::{with_deadline, MessageRouter, Transport, TransportError, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enumerator::{EnumerationError, Enumerator, EnumeratorConfig};
use crate::monitor::MonitorFactory;
use crate::poller::{Poller, PollerConfig};

/// Section holding the persisted registry
pub const REGISTRY_SECTION: &str = "Registry";
/// Section holding per-device capability state
pub const CAPABILITY_SECTION: &str = "Capability";

/// A unit of device functionality layered on the gateway core
#[async_trait]
pub trait Capability: Send + Sync {
    /// Tag recorded on devices that have this capability
    fn tag(&self) -> CapabilityTag;

    fn name(&self) -> &str;

    /// Inspect a freshly enumerated device and attach to it if supported
    async fn enumerate_device(&self, device: &Arc<Device>) -> anyhow::Result<()>;

    /// Resume state persisted for a device after a restart
    async fn load_device(&self, _device: &Arc<Device>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release everything held for a device that is going away
    async fn detach_device(&self, _device: &Arc<Device>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registered capabilities in registration order
pub type CapabilityList = Arc<RwLock<Vec<Arc<dyn Capability>>>>;

/// Where a capability keeps its state for one device
pub fn capability_section(store: &Store, device: DeviceId, name: &str) -> Section {
    store
        .section(CAPABILITY_SECTION)
        .section(&device.to_string())
        .section(name)
}

pub(crate) fn snapshot(list: &CapabilityList) -> Vec<Arc<dyn Capability>> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Detach every capability present on a device and drop its persisted state
pub(crate) async fn release_device(list: &CapabilityList, store: &Store, device: &Arc<Device>) {
    for capability in snapshot(list) {
        if !device.has_capability(capability.tag()).await {
            continue;
        }
        if let Err(e) = capability.detach_device(device).await {
            warn!(capability = capability.name(), device = %device.id(), error = %e, "Detach failed");
        }
    }
    store
        .section(CAPABILITY_SECTION)
        .section(&device.id().to_string())
        .delete();
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Gateway core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Endpoint the gateway binds devices to
    pub gateway_endpoint: Endpoint,
    /// Deadline of a single protocol round-trip in milliseconds
    pub operation_timeout_ms: u64,
    pub poller: PollerConfig,
    pub enumerator: EnumeratorConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            gateway_endpoint: DEFAULT_GATEWAY_ENDPOINT,
            operation_timeout_ms: DEFAULT_TIMEOUT_MS,
            poller: PollerConfig::default(),
            enumerator: EnumeratorConfig::default(),
        }
    }
}

/// Composition root of the gateway core
pub struct CapabilityManager {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    poller: Arc<Poller>,
    enumerator: Enumerator,
    monitors: MonitorFactory,
    store: Store,
    capabilities: CapabilityList,
    operation_timeout: Duration,
}

impl CapabilityManager {
    /// Wire up the core; spawns poller and enumerator workers
    pub fn new(
        config: ManagerConfig,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        router: Arc<MessageRouter>,
        store: Store,
    ) -> Self {
        let operation_timeout = Duration::from_millis(config.operation_timeout_ms);
        let capabilities: CapabilityList = Arc::new(RwLock::new(Vec::new()));
        let poller = Arc::new(Poller::new(config.poller, registry.clone()));
        let enumerator = Enumerator::new(
            config.enumerator,
            registry.clone(),
            transport.clone(),
            capabilities.clone(),
            store.clone(),
        );
        let monitors = MonitorFactory::new(
            registry.clone(),
            transport.clone(),
            router.clone(),
            poller.clone(),
            config.gateway_endpoint,
        )
        .with_operation_timeout(operation_timeout);

        Self {
            registry,
            transport,
            router,
            poller,
            enumerator,
            monitors,
            store,
            capabilities,
            operation_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &Events {
        self.registry.events()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn enumerator(&self) -> &Enumerator {
        &self.enumerator
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn monitor_factory(&self) -> &MonitorFactory {
        &self.monitors
    }

    /// Deadline for one protocol round-trip
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Add a capability; returns false if one with the same tag exists
    pub fn register(&self, capability: Arc<dyn Capability>) -> bool {
        let mut capabilities = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if capabilities.iter().any(|c| c.tag() == capability.tag()) {
            warn!(capability = capability.name(), "Capability already registered");
            return false;
        }
        info!(capability = capability.name(), "Capability registered");
        capabilities.push(capability);
        true
    }

    pub fn capabilities(&self) -> Vec<Arc<dyn Capability>> {
        snapshot(&self.capabilities)
    }

    pub fn capability(&self, tag: CapabilityTag) -> Option<Arc<dyn Capability>> {
        self.capabilities().into_iter().find(|c| c.tag() == tag)
    }

    /// Persistence section owned by one capability on one device
    pub fn device_section(&self, device: DeviceId, capability: &dyn Capability) -> Section {
        capability_section(&self.store, device, capability.name())
    }

    /// A node announced itself; new nodes are queued for enumeration
    pub async fn node_joined(
        &self,
        address: IeeeAddress,
        short_address: u16,
    ) -> Result<Arc<Node>, ManagerError> {
        let (node, created) = self.registry.create_node(address).await;
        node.set_short_address(short_address).await;
        node.touch().await;
        self.events().send(GatewayEvent::NodeJoined(address));
        info!(node = %address, short_address = format_args!("{:#06x}", short_address), new = created, "Node joined");

        if created {
            self.enumerator.enumerate(&node)?;
        }
        Ok(node)
    }

    /// A node left the network; release and forget everything it hosted
    pub async fn node_left(&self, address: IeeeAddress) -> bool {
        for device in self.registry.devices_on_node(address).await {
            release_device(&self.capabilities, &self.store, &device).await;
        }
        let removed = self.registry.remove_node(address).await;
        if removed {
            self.events().send(GatewayEvent::NodeLeft(address));
            info!(node = %address, "Node left");
        }
        removed
    }

    /// Run enumeration again on the node hosting `device`
    pub async fn enumerate_device(&self, device: DeviceId) -> Result<(), ManagerError> {
        let node = self.hosting_node(device).await?;
        self.enumerator.enumerate(&node)?;
        Ok(())
    }

    /// Ask the node hosting `device` to leave the network.
    ///
    /// With `force` the node is also removed locally right away, whether or
    /// not the request got through.
    pub async fn remove_device(&self, device: DeviceId, force: bool) -> Result<(), ManagerError> {
        let node = self.hosting_node(device).await?;
        let result = with_deadline(self.operation_timeout, self.transport.request_leave(&node)).await;

        if force {
            if let Err(e) = &result {
                warn!(device = %device, error = %e, "Leave request failed, removing anyway");
            }
            self.node_left(node.address()).await;
            return Ok(());
        }

        result?;
        info!(device = %device, "Leave requested");
        Ok(())
    }

    async fn hosting_node(&self, device: DeviceId) -> Result<Arc<Node>, RegistryError> {
        let device = self
            .registry
            .get_device(device)
            .await
            .ok_or(RegistryError::DeviceNotFound(device))?;
        device
            .node()
            .ok_or(RegistryError::NodeNotFound(device.ieee_address()))
    }

    /// Resume every capability on every known device; returns how many resumed
    pub async fn load(&self) -> usize {
        let capabilities = self.capabilities();
        let mut loaded = 0;
        for device in self.registry.devices().await {
            for capability in &capabilities {
                if !device.has_capability(capability.tag()).await {
                    continue;
                }
                match capability.load_device(&device).await {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!(
                        capability = capability.name(),
                        device = %device.id(),
                        error = %e,
                        "Failed to load capability"
                    ),
                }
            }
        }
        debug!(loaded, "Capabilities loaded");
        loaded
    }

    /// Write the registry into the store
    pub async fn persist(&self) {
        self.registry
            .persist(&self.store.section(REGISTRY_SECTION))
            .await;
    }

    /// Rebuild the registry from the store and resume capabilities
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let section = self.store.section(REGISTRY_SECTION);
        if !section.exists() {
            return Ok(0);
        }
        let devices = self.registry.restore(&section).await?;
        info!(devices, "Registry restored");
        Ok(self.load().await)
    }

    pub fn stop(&self) {
        self.poller.stop();
        self.enumerator.stop();
    }
}
