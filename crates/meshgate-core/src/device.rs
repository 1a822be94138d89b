//! Node and device types for tracking joined hardware
//!
//! A [`Node`] is one physical radio unit, keyed by its IEEE address. A
//! [`Device`] is a logical entity hosted on a node, keyed by the node address
//! plus a small sub-identifier. Every node and device carries its own lock so
//! unrelated hardware never contends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::registry::RegistryError;

/// Endpoint number on a node
pub type Endpoint = u8;

/// Cluster identifier
pub type ClusterId = u16;

/// Number of transaction sequence values in each node's rotation
pub const TRANSACTION_SEQUENCE_COUNT: usize = 256;

/// 64-bit IEEE (extended) address, the immutable identity of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IeeeAddress(pub u64);

impl std::fmt::Display for IeeeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for IeeeAddress {
    type Err = ParseIntError;

    /// Parse 16 hex digits, with or without a `0x` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("0x").replace(':', "");
        u64::from_str_radix(&digits, 16).map(Self)
    }
}

/// Identifier of a logical device: hosting node plus sub-identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub node: IeeeAddress,
    pub sub_id: u8,
}

impl DeviceId {
    pub fn new(node: IeeeAddress, sub_id: u8) -> Self {
        Self { node, sub_id }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.node, self.sub_id)
    }
}

/// Opaque capability tag attached to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability(pub u16);

impl Capability {
    pub const ENUMERATE_DEVICE: Capability = Capability(0x0001);
    pub const DEVICE_REMOVAL: Capability = Capability(0x0002);
    pub const ON_OFF: Capability = Capability(0x0010);
    pub const LEVEL: Capability = Capability(0x0011);
    pub const COLOR: Capability = Capability(0x0012);
    pub const TEMPERATURE_SENSOR: Capability = Capability(0x0020);
    pub const POWER_SUPPLY: Capability = Capability(0x0030);

    /// Capabilities every device carries for its whole lifetime
    pub const BUILT_IN: [Capability; 2] = [Self::ENUMERATE_DEVICE, Self::DEVICE_REMOVAL];

    pub fn is_built_in(&self) -> bool {
        Self::BUILT_IN.contains(self)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::ENUMERATE_DEVICE => "EnumerateDevice",
            Self::DEVICE_REMOVAL => "DeviceRemoval",
            Self::ON_OFF => "OnOff",
            Self::LEVEL => "Level",
            Self::COLOR => "Color",
            Self::TEMPERATURE_SENSOR => "TemperatureSensor",
            Self::POWER_SUPPLY => "PowerSupply",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name(), self.0)
    }
}

/// Role of a node in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Coordinator,
    Router,
    EndDevice,
    #[default]
    Unknown,
}

impl LogicalType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Coordinator,
            1 => Self::Router,
            2 => Self::EndDevice,
            _ => Self::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Coordinator => 0,
            Self::Router => 1,
            Self::EndDevice => 2,
            Self::Unknown => 0xff,
        }
    }
}

/// Node descriptor as returned by descriptor discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub logical_type: LogicalType,
    pub manufacturer_code: u16,
    /// Raw MAC capability flags
    pub mac_capability_flags: u8,
}

impl NodeDescriptor {
    pub const FLAG_MAINS_POWERED: u8 = 0x04;
    pub const FLAG_RX_ON_WHEN_IDLE: u8 = 0x08;

    pub fn is_mains_powered(&self) -> bool {
        self.mac_capability_flags & Self::FLAG_MAINS_POWERED != 0
    }

    pub fn receiver_on_when_idle(&self) -> bool {
        self.mac_capability_flags & Self::FLAG_RX_ON_WHEN_IDLE != 0
    }
}

/// Descriptor of one endpoint hosted on a node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub endpoint: Endpoint,
    pub profile_id: u16,
    pub device_id: u16,
    pub device_version: u8,
    pub in_clusters: Vec<ClusterId>,
    pub out_clusters: Vec<ClusterId>,
}

impl EndpointDescriptor {
    pub fn has_in_cluster(&self, cluster: ClusterId) -> bool {
        self.in_clusters.contains(&cluster)
    }
}

/// Mutable node fields, guarded by the node's lock
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// 16-bit network (short) address, changes on rejoin
    pub short_address: u16,
    pub descriptor: Option<NodeDescriptor>,
    pub endpoints: Vec<Endpoint>,
    pub endpoint_descriptors: BTreeMap<Endpoint, EndpointDescriptor>,
    /// Whether the node accepts acknowledged transport
    pub supports_ack: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A physical radio-addressable unit
#[derive(Debug)]
pub struct Node {
    address: IeeeAddress,
    info: RwLock<NodeInfo>,
    sequences: Mutex<VecDeque<u8>>,
    enumeration: Arc<Semaphore>,
}

/// Held for the whole of one enumeration pass over a node
pub type EnumerationPermit = OwnedSemaphorePermit;

impl Node {
    pub fn new(address: IeeeAddress) -> Self {
        let now = Utc::now();
        Self {
            address,
            info: RwLock::new(NodeInfo {
                short_address: 0xfffe,
                descriptor: None,
                endpoints: Vec::new(),
                endpoint_descriptors: BTreeMap::new(),
                supports_ack: true,
                first_seen: now,
                last_seen: now,
            }),
            sequences: Mutex::new((0..=u8::MAX).collect()),
            enumeration: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn address(&self) -> IeeeAddress {
        self.address
    }

    /// Point-in-time copy of the mutable fields
    pub async fn info(&self) -> NodeInfo {
        self.info.read().await.clone()
    }

    pub async fn short_address(&self) -> u16 {
        self.info.read().await.short_address
    }

    pub async fn set_short_address(&self, short_address: u16) {
        self.info.write().await.short_address = short_address;
    }

    pub async fn descriptor(&self) -> Option<NodeDescriptor> {
        self.info.read().await.descriptor
    }

    pub async fn set_descriptor(&self, descriptor: NodeDescriptor) {
        self.info.write().await.descriptor = Some(descriptor);
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.info.read().await.endpoints.clone()
    }

    /// Replace the endpoint list, dropping descriptors of endpoints that vanished
    pub async fn set_endpoints(&self, mut endpoints: Vec<Endpoint>) {
        endpoints.sort_unstable();
        endpoints.dedup();
        let mut info = self.info.write().await;
        info.endpoint_descriptors
            .retain(|endpoint, _| endpoints.contains(endpoint));
        info.endpoints = endpoints;
    }

    pub async fn endpoint_descriptor(&self, endpoint: Endpoint) -> Option<EndpointDescriptor> {
        self.info.read().await.endpoint_descriptors.get(&endpoint).cloned()
    }

    pub async fn endpoint_descriptors(&self) -> Vec<EndpointDescriptor> {
        self.info.read().await.endpoint_descriptors.values().cloned().collect()
    }

    pub async fn set_endpoint_descriptor(&self, descriptor: EndpointDescriptor) {
        let mut info = self.info.write().await;
        if !info.endpoints.contains(&descriptor.endpoint) {
            info.endpoints.push(descriptor.endpoint);
            info.endpoints.sort_unstable();
        }
        info.endpoint_descriptors.insert(descriptor.endpoint, descriptor);
    }

    pub async fn supports_ack(&self) -> bool {
        self.info.read().await.supports_ack
    }

    pub async fn set_supports_ack(&self, supports_ack: bool) {
        self.info.write().await.supports_ack = supports_ack;
    }

    /// Update the last seen timestamp
    pub async fn touch(&self) {
        self.info.write().await.last_seen = Utc::now();
    }

    /// Take the next transaction sequence number from the rotation.
    ///
    /// The value is returned to the back of the pool immediately, so a number
    /// is not handed out again until 256 further requests have been issued.
    pub fn next_transaction_sequence(&self) -> u8 {
        let mut pool = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        match pool.pop_front() {
            Some(seq) => {
                pool.push_back(seq);
                seq
            }
            None => 0,
        }
    }

    /// Number of sequence values currently in rotation
    pub fn transaction_sequence_pool_len(&self) -> usize {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Try to claim the node for enumeration without waiting
    pub fn try_begin_enumeration(&self) -> Option<EnumerationPermit> {
        Arc::clone(&self.enumeration).try_acquire_owned().ok()
    }

    pub fn is_enumerating(&self) -> bool {
        self.enumeration.available_permits() == 0
    }
}

/// Mutable device fields, guarded by the device's lock
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub endpoints: Vec<Endpoint>,
    pub capabilities: Vec<Capability>,
}

/// A logical device hosted on a node
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    node: Weak<Node>,
    info: RwLock<DeviceInfo>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, node: &Arc<Node>) -> Self {
        Self {
            id,
            node: Arc::downgrade(node),
            info: RwLock::new(DeviceInfo {
                endpoints: Vec::new(),
                capabilities: Capability::BUILT_IN.to_vec(),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn ieee_address(&self) -> IeeeAddress {
        self.id.node
    }

    /// Hosting node, if it is still registered
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub async fn info(&self) -> DeviceInfo {
        self.info.read().await.clone()
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.info.read().await.endpoints.clone()
    }

    /// Assign the endpoint subset this device owns.
    ///
    /// Every endpoint must exist on the hosting node.
    pub async fn set_endpoints(&self, mut endpoints: Vec<Endpoint>) -> Result<(), RegistryError> {
        let node = self
            .node()
            .ok_or(RegistryError::NodeNotFound(self.id.node))?;
        let node_endpoints = node.endpoints().await;
        if let Some(&missing) = endpoints.iter().find(|e| !node_endpoints.contains(e)) {
            return Err(RegistryError::EndpointNotOnNode {
                device: self.id,
                endpoint: missing,
            });
        }
        endpoints.sort_unstable();
        endpoints.dedup();
        self.info.write().await.endpoints = endpoints;
        Ok(())
    }

    pub async fn capabilities(&self) -> Vec<Capability> {
        self.info.read().await.capabilities.clone()
    }

    pub async fn has_capability(&self, capability: Capability) -> bool {
        self.info.read().await.capabilities.contains(&capability)
    }

    /// Add a capability, returns false if it was already present
    pub async fn add_capability(&self, capability: Capability) -> bool {
        let mut info = self.info.write().await;
        if info.capabilities.contains(&capability) {
            return false;
        }
        info.capabilities.push(capability);
        true
    }

    /// Remove a capability, returns false if absent or built in
    pub async fn remove_capability(&self, capability: Capability) -> bool {
        if capability.is_built_in() {
            return false;
        }
        let mut info = self.info.write().await;
        let before = info.capabilities.len();
        info.capabilities.retain(|c| *c != capability);
        info.capabilities.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ieee_address_display_and_parse() {
        let addr = IeeeAddress(0x00124b0012345678);
        assert_eq!(addr.to_string(), "00124b0012345678");
        assert_eq!("0x00124b0012345678".parse::<IeeeAddress>().unwrap(), addr);
        assert_eq!("00:12:4b:00:12:34:56:78".parse::<IeeeAddress>().unwrap(), addr);
    }

    #[test]
    fn test_transaction_sequence_rotation() {
        let node = Node::new(IeeeAddress(1));
        let seen: HashSet<u8> = (0..256).map(|_| node.next_transaction_sequence()).collect();
        assert_eq!(seen.len(), 256);
        assert_eq!(node.transaction_sequence_pool_len(), TRANSACTION_SEQUENCE_COUNT);
        // The rotation starts over after a full cycle
        assert_eq!(node.next_transaction_sequence(), 0);
        assert_eq!(node.next_transaction_sequence(), 1);
    }

    #[test]
    fn test_transaction_sequence_concurrent() {
        let node = Arc::new(Node::new(IeeeAddress(2)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                std::thread::spawn(move || {
                    (0..32).map(|_| node.next_transaction_sequence()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(seen.insert(seq), "sequence {} issued twice", seq);
            }
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(node.transaction_sequence_pool_len(), TRANSACTION_SEQUENCE_COUNT);
    }

    #[test]
    fn test_enumeration_permit_is_exclusive() {
        let node = Node::new(IeeeAddress(3));
        let permit = node.try_begin_enumeration().expect("first permit");
        assert!(node.is_enumerating());
        assert!(node.try_begin_enumeration().is_none());
        drop(permit);
        assert!(node.try_begin_enumeration().is_some());
    }

    #[tokio::test]
    async fn test_device_capabilities_are_a_set() {
        let node = Arc::new(Node::new(IeeeAddress(4)));
        let device = Device::new(DeviceId::new(node.address(), 0), &node);

        assert!(device.has_capability(Capability::ENUMERATE_DEVICE).await);
        assert!(device.add_capability(Capability::ON_OFF).await);
        assert!(!device.add_capability(Capability::ON_OFF).await);
        assert_eq!(device.capabilities().await.len(), 3);

        assert!(!device.remove_capability(Capability::DEVICE_REMOVAL).await);
        assert!(device.remove_capability(Capability::ON_OFF).await);
        assert!(!device.remove_capability(Capability::ON_OFF).await);
    }

    #[tokio::test]
    async fn test_device_endpoints_must_be_on_node() {
        let node = Arc::new(Node::new(IeeeAddress(5)));
        node.set_endpoints(vec![1, 2]).await;
        let device = Device::new(DeviceId::new(node.address(), 0), &node);

        device.set_endpoints(vec![2, 1, 2]).await.unwrap();
        assert_eq!(device.endpoints().await, vec![1, 2]);

        let err = device.set_endpoints(vec![3]).await.unwrap_err();
        assert!(matches!(err, RegistryError::EndpointNotOnNode { endpoint: 3, .. }));
    }

    #[test]
    fn test_node_descriptor_flags() {
        let descriptor = NodeDescriptor {
            logical_type: LogicalType::Router,
            manufacturer_code: 0x1234,
            mac_capability_flags: 0x8e,
        };
        assert!(descriptor.is_mains_powered());
        assert!(descriptor.receiver_on_when_idle());
        assert_eq!(LogicalType::from_u8(descriptor.logical_type.as_u8()), LogicalType::Router);
    }
}
