//! On/off capability
//!
//! Tracks the on/off attribute of every device that exposes the on/off
//! cluster and sends on, off and toggle commands.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use meshgate_core::{Capability as CapabilityTag, Device, DeviceId, Endpoint, Store};
use meshgate_engine::{
    capability_section, AttributeMonitor, Capability, CapabilityManager, MonitorFactory,
    PollingConfig, ReportingConfig,
};
use meshgate_zcl::types::{cluster, on_off};
use meshgate_zcl::{with_deadline, DataType, Transport, ZclMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const REPORTING_MIN_INTERVAL: Duration = Duration::from_secs(1);
const REPORTING_MAX_INTERVAL: Duration = Duration::from_secs(300);
const POLLING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnOffCommand {
    Off,
    On,
    Toggle,
}

impl OnOffCommand {
    fn command_id(self) -> u8 {
        match self {
            OnOffCommand::Off => on_off::CMD_OFF,
            OnOffCommand::On => on_off::CMD_ON,
            OnOffCommand::Toggle => on_off::CMD_TOGGLE,
        }
    }
}

pub struct OnOffCapability {
    factory: MonitorFactory,
    transport: Arc<dyn Transport>,
    store: Store,
    operation_timeout: Duration,
    monitors: RwLock<HashMap<DeviceId, Arc<AttributeMonitor>>>,
    states: Arc<Mutex<HashMap<DeviceId, bool>>>,
}

impl OnOffCapability {
    pub fn new(manager: &CapabilityManager) -> Self {
        Self {
            factory: manager.monitor_factory().clone(),
            transport: manager.transport().clone(),
            store: manager.store().clone(),
            operation_timeout: manager.operation_timeout(),
            monitors: RwLock::new(HashMap::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Last known state of a device
    pub fn state(&self, device: DeviceId) -> Option<bool> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .copied()
    }

    fn monitor(&self, device: DeviceId) -> AttributeMonitor {
        let states = self.states.clone();
        self.factory.create(
            capability_section(&self.store, device, self.name()),
            move |device, value| {
                let Some(on) = value.as_bool() else {
                    debug!(device = %device, ?value, "Ignoring non-boolean on/off value");
                    return;
                };
                let previous = states
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(device, on);
                if previous != Some(on) {
                    info!(device = %device, on, "On/off state changed");
                }
            },
        )
    }

    /// First endpoint of the device hosting the on/off server cluster
    async fn on_off_endpoint(device: &Device) -> Option<Endpoint> {
        let node = device.node()?;
        for endpoint in device.endpoints().await {
            if let Some(descriptor) = node.endpoint_descriptor(endpoint).await {
                if descriptor.has_in_cluster(cluster::ON_OFF) {
                    return Some(endpoint);
                }
            }
        }
        None
    }

    /// Send a command and refresh the state right after
    pub async fn send(&self, device: &Device, command: OnOffCommand) -> Result<()> {
        let monitor = self
            .monitors
            .read()
            .await
            .get(&device.id())
            .cloned()
            .ok_or_else(|| anyhow!("Device {} has no on/off capability", device.id()))?;
        let attachment = monitor
            .attachment()
            .await
            .ok_or_else(|| anyhow!("On/off monitor of {} is not attached", device.id()))?;
        let node = device
            .node()
            .ok_or_else(|| anyhow!("Node of device {} is gone", device.id()))?;

        let message = ZclMessage::command(
            node.address(),
            attachment.endpoints.local,
            attachment.endpoints.remote,
            cluster::ON_OFF,
            node.next_transaction_sequence(),
            command.command_id(),
            Vec::new(),
        );
        with_deadline(self.operation_timeout, self.transport.send_request(&node, message))
            .await
            .with_context(|| format!("Sending {:?} to {}", command, device.id()))?;

        monitor.poll().await?;
        Ok(())
    }
}

#[async_trait]
impl Capability for OnOffCapability {
    fn tag(&self) -> CapabilityTag {
        CapabilityTag::ON_OFF
    }

    fn name(&self) -> &str {
        CapabilityTag::ON_OFF.name()
    }

    async fn enumerate_device(&self, device: &Arc<Device>) -> Result<()> {
        let Some(endpoint) = Self::on_off_endpoint(device).await else {
            debug!(device = %device.id(), "No on/off cluster");
            return Ok(());
        };

        let previous = self.monitors.write().await.remove(&device.id());
        if let Some(previous) = previous {
            previous.detach(false).await?;
        }

        let monitor = self.monitor(device.id());
        monitor
            .attach(
                device,
                endpoint,
                cluster::ON_OFF,
                on_off::ATTR_ON_OFF,
                DataType::Boolean,
                ReportingConfig::attempt(REPORTING_MIN_INTERVAL, REPORTING_MAX_INTERVAL),
                PollingConfig::if_reporting_failed(POLLING_INTERVAL),
            )
            .await?;
        // Pick up the current value instead of waiting for the first report
        if let Err(e) = monitor.poll().await {
            debug!(device = %device.id(), error = %e, "Initial on/off read failed");
        }

        device.add_capability(self.tag()).await;
        self.monitors
            .write()
            .await
            .insert(device.id(), Arc::new(monitor));
        Ok(())
    }

    async fn load_device(&self, device: &Arc<Device>) -> Result<()> {
        let monitor = self.monitor(device.id());
        monitor.load(device).await?;
        self.monitors
            .write()
            .await
            .insert(device.id(), Arc::new(monitor));
        Ok(())
    }

    async fn detach_device(&self, device: &Arc<Device>) -> Result<()> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device.id());
        let monitor = self.monitors.write().await.remove(&device.id());
        if let Some(monitor) = monitor {
            monitor.detach(true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::{EndpointDescriptor, Events, GatewayEvent, IeeeAddress, NodeDescriptor, Registry};
    use meshgate_engine::ManagerConfig;
    use meshgate_zcl::types::PROFILE_HOME_AUTOMATION;
    use meshgate_zcl::{AttributeValue, MessageRouter, SimulatedNode, SimulatedTransport};

    const NODE: IeeeAddress = IeeeAddress(0x842e14fffe000001);

    async fn setup() -> (Arc<CapabilityManager>, Arc<SimulatedTransport>, Arc<OnOffCapability>) {
        let registry = Arc::new(Registry::new(Events::default()));
        let router = Arc::new(MessageRouter::new());
        let sim = Arc::new(SimulatedTransport::new(router.clone()));
        sim.add_node(
            NODE,
            SimulatedNode::new(NodeDescriptor::default()).with_endpoint(EndpointDescriptor {
                endpoint: 11,
                profile_id: PROFILE_HOME_AUTOMATION,
                device_id: 0x0100,
                device_version: 1,
                in_clusters: vec![cluster::BASIC, cluster::ON_OFF],
                out_clusters: Vec::new(),
            }),
        );
        sim.set_attribute(
            NODE,
            11,
            cluster::ON_OFF,
            on_off::ATTR_ON_OFF,
            DataType::Boolean,
            AttributeValue::Bool(false),
        );

        let manager = Arc::new(CapabilityManager::new(
            ManagerConfig::default(),
            registry,
            sim.clone(),
            router,
            Store::new(),
        ));
        let capability = Arc::new(OnOffCapability::new(&manager));
        manager.register(capability.clone());
        (manager, sim, capability)
    }

    async fn enumerated(manager: &CapabilityManager) -> Arc<Device> {
        let mut events = manager.events().subscribe();
        manager.node_joined(NODE, 0x0001).await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let GatewayEvent::EnumerationSucceeded(id) = event {
                return manager.registry().get_device(id).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_enumeration_attaches_and_reads() {
        let (manager, sim, capability) = setup().await;
        let device = enumerated(&manager).await;

        assert!(device.has_capability(CapabilityTag::ON_OFF).await);
        assert_eq!(capability.state(device.id()), Some(false));
        assert!(sim.reporting_configured(NODE, 11, cluster::ON_OFF, on_off::ATTR_ON_OFF));
    }

    #[tokio::test]
    async fn test_commands_update_state() {
        let (manager, _sim, capability) = setup().await;
        let device = enumerated(&manager).await;

        capability.send(&device, OnOffCommand::On).await.unwrap();
        assert_eq!(capability.state(device.id()), Some(true));

        capability.send(&device, OnOffCommand::Toggle).await.unwrap();
        assert_eq!(capability.state(device.id()), Some(false));
    }

    #[tokio::test]
    async fn test_node_left_releases_device() {
        let (manager, sim, capability) = setup().await;
        let device = enumerated(&manager).await;

        manager.node_left(NODE).await;
        assert_eq!(capability.state(device.id()), None);
        assert!(capability.send(&device, OnOffCommand::On).await.is_err());
        assert!(!sim.reporting_configured(NODE, 11, cluster::ON_OFF, on_off::ATTR_ON_OFF));
    }
}
