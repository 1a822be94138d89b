//! Node and device registry
//!
//! The registry is the single owner of node and device state. Lookups hand
//! out `Arc`s; listings are point-in-time snapshots rather than live views.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::device::{
    Capability, Device, DeviceId, Endpoint, EndpointDescriptor, IeeeAddress, LogicalType, Node,
    NodeDescriptor,
};
use crate::event::{Events, GatewayEvent};
use crate::store::{Section, StoreError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Node {0} not found")]
    NodeNotFound(IeeeAddress),
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("Endpoint {endpoint} of device {device} is not hosted on its node")]
    EndpointNotOnNode { device: DeviceId, endpoint: Endpoint },
    #[error("No free sub-identifier left on node {0}")]
    NoFreeSubId(IeeeAddress),
    #[error("Persisted registry is invalid: {0}")]
    Store(#[from] StoreError),
}

/// Registry of joined nodes and the devices they host
#[derive(Debug)]
pub struct Registry {
    nodes: RwLock<HashMap<IeeeAddress, Arc<Node>>>,
    devices: RwLock<BTreeMap<DeviceId, Arc<Device>>>,
    events: Events,
}

impl Registry {
    pub fn new(events: Events) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            devices: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Get or create a node; the flag is true if it was created
    pub async fn create_node(&self, address: IeeeAddress) -> (Arc<Node>, bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get(&address) {
            return (node.clone(), false);
        }
        let node = Arc::new(Node::new(address));
        nodes.insert(address, node.clone());
        debug!(node = %address, "Node created");
        (node, true)
    }

    pub async fn get_node(&self, address: IeeeAddress) -> Option<Arc<Node>> {
        self.nodes.read().await.get(&address).cloned()
    }

    pub async fn contains_node(&self, address: IeeeAddress) -> bool {
        self.nodes.read().await.contains_key(&address)
    }

    /// Remove a node and every device it hosts
    pub async fn remove_node(&self, address: IeeeAddress) -> bool {
        // Lock order is nodes then devices, as in device creation
        let mut nodes = self.nodes.write().await;
        if nodes.remove(&address).is_none() {
            return false;
        }

        let removed: Vec<DeviceId> = {
            let mut devices = self.devices.write().await;
            let ids: Vec<DeviceId> = devices
                .keys()
                .filter(|id| id.node == address)
                .copied()
                .collect();
            for id in &ids {
                devices.remove(id);
            }
            ids
        };
        drop(nodes);

        for id in removed {
            self.events.send(GatewayEvent::DeviceRemoved(id));
        }
        info!(node = %address, "Node removed from registry");
        true
    }

    /// Snapshot of all nodes
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Get or create the device with the given sub-identifier
    pub async fn create_device(
        &self,
        address: IeeeAddress,
        sub_id: u8,
    ) -> Result<(Arc<Device>, bool), RegistryError> {
        // Hold the node map until the device is in, so a concurrent
        // remove_node cannot leave it orphaned
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(&address)
            .ok_or(RegistryError::NodeNotFound(address))?;
        let id = DeviceId::new(address, sub_id);

        let device = {
            let mut devices = self.devices.write().await;
            if let Some(device) = devices.get(&id) {
                return Ok((device.clone(), false));
            }
            let device = Arc::new(Device::new(id, node));
            devices.insert(id, device.clone());
            device
        };
        drop(nodes);

        info!(device = %id, "Device added");
        self.events.send(GatewayEvent::DeviceAdded(id));
        Ok((device, true))
    }

    /// Create a device on the smallest unused sub-identifier
    pub async fn create_next_device(&self, address: IeeeAddress) -> Result<Arc<Device>, RegistryError> {
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(&address)
            .ok_or(RegistryError::NodeNotFound(address))?;

        let device = {
            let mut devices = self.devices.write().await;
            let sub_id = (0..=u8::MAX)
                .find(|sub_id| !devices.contains_key(&DeviceId::new(address, *sub_id)))
                .ok_or(RegistryError::NoFreeSubId(address))?;
            let id = DeviceId::new(address, sub_id);
            let device = Arc::new(Device::new(id, node));
            devices.insert(id, device.clone());
            device
        };
        drop(nodes);

        info!(device = %device.id(), "Device added");
        self.events.send(GatewayEvent::DeviceAdded(device.id()));
        Ok(device)
    }

    pub async fn get_device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.read().await.get(&id).cloned()
    }

    pub async fn contains_device(&self, id: DeviceId) -> bool {
        self.devices.read().await.contains_key(&id)
    }

    /// Remove a device, returns true if it was found and removed
    pub async fn remove_device(&self, id: DeviceId) -> bool {
        if self.devices.write().await.remove(&id).is_some() {
            info!(device = %id, "Device removed from registry");
            self.events.send(GatewayEvent::DeviceRemoved(id));
            true
        } else {
            false
        }
    }

    /// Snapshot of all devices, ordered by id
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Snapshot of the devices hosted on one node, ordered by sub-identifier
    pub async fn devices_on_node(&self, address: IeeeAddress) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .await
            .range(DeviceId::new(address, 0)..=DeviceId::new(address, u8::MAX))
            .map(|(_, device)| device.clone())
            .collect()
    }

    /// Write every node and device below `section`, replacing what was there
    pub async fn persist(&self, section: &Section) {
        section.delete();

        for node in self.nodes().await {
            let info = node.info().await;
            let node_section = section.section("Node").section(&node.address().to_string());
            node_section.set("ShortAddress", info.short_address);
            node_section.set("SupportsAck", info.supports_ack);

            if let Some(descriptor) = info.descriptor {
                node_section.set("LogicalType", descriptor.logical_type.as_u8());
                node_section.set("ManufacturerCode", descriptor.manufacturer_code);
                node_section.set("MacCapabilityFlags", descriptor.mac_capability_flags);
            }

            for endpoint in &info.endpoints {
                let ep_section = node_section.section("Endpoint").section(&endpoint.to_string());
                ep_section.set("Present", true);
                if let Some(desc) = info.endpoint_descriptors.get(endpoint) {
                    ep_section.set("ProfileId", desc.profile_id);
                    ep_section.set("DeviceId", desc.device_id);
                    ep_section.set("DeviceVersion", desc.device_version);
                    ep_section.set("InClusters", join_ids(&desc.in_clusters));
                    ep_section.set("OutClusters", join_ids(&desc.out_clusters));
                }
            }
        }

        for device in self.devices().await {
            let info = device.info().await;
            let id = device.id();
            let dev_section = section
                .section("Node")
                .section(&id.node.to_string())
                .section("Device")
                .section(&id.sub_id.to_string());
            dev_section.set("Endpoints", join_ids(&info.endpoints));
            let tags: Vec<u16> = info.capabilities.iter().map(|c| c.0).collect();
            dev_section.set("Capabilities", join_ids(&tags));
        }
    }

    /// Rebuild nodes and devices from `section` without emitting events
    pub async fn restore(&self, section: &Section) -> Result<usize, RegistryError> {
        let nodes_section = section.section("Node");
        let mut restored = 0;

        for name in nodes_section.sections() {
            let Ok(address) = name.parse::<IeeeAddress>() else {
                warn!(section = %name, "Skipping node with unparseable address");
                continue;
            };
            let node_section = nodes_section.section(&name);
            let (node, _) = self.create_node(address).await;

            node.set_short_address(node_section.get_uint("ShortAddress")?).await;
            node.set_supports_ack(node_section.get_bool("SupportsAck")?).await;

            if node_section.has("ManufacturerCode") {
                node.set_descriptor(NodeDescriptor {
                    logical_type: LogicalType::from_u8(node_section.get_uint("LogicalType")?),
                    manufacturer_code: node_section.get_uint("ManufacturerCode")?,
                    mac_capability_flags: node_section.get_uint("MacCapabilityFlags")?,
                })
                .await;
            }

            let endpoints_section = node_section.section("Endpoint");
            let mut endpoints = Vec::new();
            for ep_name in endpoints_section.sections() {
                let Ok(endpoint) = ep_name.parse::<Endpoint>() else {
                    continue;
                };
                endpoints.push(endpoint);
            }
            node.set_endpoints(endpoints.clone()).await;

            for endpoint in endpoints {
                let ep_section = endpoints_section.section(&endpoint.to_string());
                if !ep_section.has("ProfileId") {
                    continue;
                }
                node.set_endpoint_descriptor(EndpointDescriptor {
                    endpoint,
                    profile_id: ep_section.get_uint("ProfileId")?,
                    device_id: ep_section.get_uint("DeviceId")?,
                    device_version: ep_section.get_uint("DeviceVersion")?,
                    in_clusters: split_ids(&ep_section.get_string("InClusters")?),
                    out_clusters: split_ids(&ep_section.get_string("OutClusters")?),
                })
                .await;
            }

            let devices_section = node_section.section("Device");
            for sub_name in devices_section.sections() {
                let Ok(sub_id) = sub_name.parse::<u8>() else {
                    continue;
                };
                let dev_section = devices_section.section(&sub_name);
                let id = DeviceId::new(address, sub_id);
                let device = Arc::new(Device::new(id, &node));
                device
                    .set_endpoints(split_ids(&dev_section.get_string("Endpoints")?))
                    .await?;
                for tag in split_ids::<u16>(&dev_section.get_string("Capabilities")?) {
                    device.add_capability(Capability(tag)).await;
                }
                self.devices.write().await.insert(id, device);
                restored += 1;
            }
        }

        info!(devices = restored, "Registry restored");
        Ok(restored)
    }
}

fn join_ids<T: Into<u64> + Copy>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| format!("{:#06x}", (*id).into()))
        .collect::<Vec<_>>()
        .join(",")
}

fn split_ids<T: TryFrom<u64>>(s: &str) -> Vec<T> {
    s.split(',')
        .filter_map(|part| u64::from_str_radix(part.trim().trim_start_matches("0x"), 16).ok())
        .filter_map(|v| T::try_from(v).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    const NODE: IeeeAddress = IeeeAddress(0x00124b0001020304);

    #[tokio::test]
    async fn test_create_node_is_idempotent() {
        let registry = Registry::new(Events::default());
        let (first, created) = registry.create_node(NODE).await;
        assert!(created);
        let (second, created) = registry.create_node(NODE).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_device_requires_node() {
        let registry = Registry::new(Events::default());
        let err = registry.create_device(NODE, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::NodeNotFound(a) if a == NODE));
    }

    #[tokio::test]
    async fn test_create_device_emits_once() {
        let events = Events::default();
        let mut rx = events.subscribe();
        let registry = Registry::new(events);
        registry.create_node(NODE).await;

        let (_, created) = registry.create_device(NODE, 3).await.unwrap();
        assert!(created);
        let (_, created) = registry.create_device(NODE, 3).await.unwrap();
        assert!(!created);

        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::DeviceAdded(DeviceId::new(NODE, 3)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_next_device_fills_smallest_gap() {
        let registry = Registry::new(Events::default());
        registry.create_node(NODE).await;
        registry.create_device(NODE, 0).await.unwrap();
        registry.create_device(NODE, 1).await.unwrap();

        let device = registry.create_next_device(NODE).await.unwrap();
        assert_eq!(device.id().sub_id, 2);

        assert!(registry.remove_device(DeviceId::new(NODE, 0)).await);
        let device = registry.create_next_device(NODE).await.unwrap();
        assert_eq!(device.id().sub_id, 0);
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let registry = Registry::new(Events::default());
        registry.create_node(NODE).await;
        registry.create_device(NODE, 0).await.unwrap();

        let snapshot = registry.devices().await;
        registry.create_device(NODE, 1).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.devices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_node_removes_devices() {
        let events = Events::default();
        let registry = Registry::new(events.clone());
        registry.create_node(NODE).await;
        registry.create_node(IeeeAddress(9)).await;
        registry.create_device(NODE, 0).await.unwrap();
        registry.create_device(NODE, 1).await.unwrap();
        registry.create_device(IeeeAddress(9), 0).await.unwrap();

        let mut rx = events.subscribe();
        assert!(registry.remove_node(NODE).await);
        assert!(!registry.remove_node(NODE).await);

        assert_eq!(registry.devices().await.len(), 1);
        assert!(registry.devices_on_node(NODE).await.is_empty());
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::DeviceRemoved(DeviceId::new(NODE, 0)));
        assert_eq!(rx.recv().await.unwrap(), GatewayEvent::DeviceRemoved(DeviceId::new(NODE, 1)));
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let registry = Registry::new(Events::default());
        let (node, _) = registry.create_node(NODE).await;
        node.set_short_address(0x1a2b).await;
        node.set_descriptor(NodeDescriptor {
            logical_type: LogicalType::Router,
            manufacturer_code: 0x115f,
            mac_capability_flags: 0x8e,
        })
        .await;
        node.set_endpoint_descriptor(EndpointDescriptor {
            endpoint: 1,
            profile_id: 0x0104,
            device_id: 0x0100,
            device_version: 1,
            in_clusters: vec![0x0000, 0x0006],
            out_clusters: vec![0x0019],
        })
        .await;
        let device = registry.create_next_device(NODE).await.unwrap();
        device.set_endpoints(vec![1]).await.unwrap();
        device.add_capability(Capability::ON_OFF).await;

        let store = Store::new();
        registry.persist(&store.section("Registry")).await;

        let restored = Registry::new(Events::default());
        assert_eq!(restored.restore(&store.section("Registry")).await.unwrap(), 1);

        let node = restored.get_node(NODE).await.unwrap();
        let info = node.info().await;
        assert_eq!(info.short_address, 0x1a2b);
        assert_eq!(info.descriptor.unwrap().manufacturer_code, 0x115f);
        assert_eq!(info.endpoints, vec![1]);
        assert_eq!(
            node.endpoint_descriptor(1).await.unwrap().in_clusters,
            vec![0x0000, 0x0006]
        );

        let device = restored.get_device(DeviceId::new(NODE, 0)).await.unwrap();
        assert_eq!(device.endpoints().await, vec![1]);
        assert!(device.has_capability(Capability::ON_OFF).await);
        assert_eq!(device.capabilities().await.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_device_creation_racing_node_removal_leaves_no_orphans() {
        let registry = Arc::new(Registry::new(Events::default()));

        for round in 0..200u64 {
            let address = IeeeAddress(round);
            registry.create_node(address).await;

            let creator = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create_next_device(address).await.is_ok() })
            };
            let remover = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.remove_node(address).await })
            };
            let created = creator.await.unwrap();
            assert!(remover.await.unwrap());

            assert!(!registry.contains_node(address).await);
            assert!(
                registry.devices_on_node(address).await.is_empty(),
                "device left behind in round {} (created: {})",
                round,
                created
            );
        }
    }

    #[test]
    fn test_id_lists() {
        assert_eq!(join_ids(&[0x0006u16, 0x0300]), "0x0006,0x0300");
        assert_eq!(split_ids::<u16>("0x0006,0x0300"), vec![0x0006, 0x0300]);
        assert!(split_ids::<u8>("").is_empty());
    }
}
