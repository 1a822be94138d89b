//! In-memory simulated network
//!
//! Stands in for a radio driver: nodes are scripted with descriptors and
//! attribute values, operations can be made to fail, and every request is
//! recorded. Attribute changes on a node with reporting configured are
//! pushed through the router as ReportAttributes frames.

use async_trait::async_trait;
use meshgate_core::{ClusterId, Endpoint, EndpointDescriptor, IeeeAddress, Node, NodeDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::message::{AttributeReport, ReadAttributeRecord, ZclCommand, ZclMessage};
use crate::router::MessageRouter;
use crate::transport::{ReportingRequest, Transport, TransportError};
use crate::types::{
    cluster, on_off, AttributeId, AttributeValue, DataType, Direction, EndpointPair, ZclStatus,
};

/// Transport operation, used to target failure injection and inspect requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Bind,
    ConfigureReporting,
    ReadAttributes,
    SendRequest,
    NodeDescriptor,
    ActiveEndpoints,
    SimpleDescriptor,
    Leave,
}

/// A request the transport received
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub node: IeeeAddress,
    pub operation: Operation,
    pub transaction_sequence: u8,
    pub cluster: Option<ClusterId>,
    pub reporting: Option<ReportingRequest>,
}

/// Script for one simulated node
#[derive(Debug, Clone, Default)]
pub struct SimulatedNode {
    pub descriptor: NodeDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl SimulatedNode {
    pub fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            descriptor,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

type AttributeKey = (Endpoint, ClusterId, AttributeId);

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(u32),
    Always,
}

#[derive(Debug)]
struct NodeState {
    script: SimulatedNode,
    attributes: HashMap<AttributeKey, (DataType, AttributeValue)>,
    /// Configured reports and the gateway endpoint they are sent to
    reporting: HashMap<AttributeKey, Endpoint>,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: HashMap<IeeeAddress, NodeState>,
    failures: HashMap<(IeeeAddress, Operation), Failure>,
    requests: Vec<RecordedRequest>,
    latency: Duration,
    report_sequence: u8,
}

/// Scripted in-memory [`Transport`]
#[derive(Debug)]
pub struct SimulatedTransport {
    router: Arc<MessageRouter>,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, address: IeeeAddress, script: SimulatedNode) {
        self.state().nodes.insert(
            address,
            NodeState {
                script,
                attributes: HashMap::new(),
                reporting: HashMap::new(),
            },
        );
    }

    pub fn remove_node(&self, address: IeeeAddress) {
        self.state().nodes.remove(&address);
    }

    /// Change an attribute on a node, pushing a report if one is configured
    pub fn set_attribute(
        &self,
        address: IeeeAddress,
        endpoint: Endpoint,
        cluster: ClusterId,
        attribute: AttributeId,
        data_type: DataType,
        value: AttributeValue,
    ) {
        let report = {
            let mut state = self.state();
            let sequence = state.report_sequence;
            let Some(node) = state.nodes.get_mut(&address) else {
                return;
            };
            let key = (endpoint, cluster, attribute);
            node.attributes.insert(key, (data_type, value.clone()));
            let destination = node.reporting.get(&key).copied();
            if destination.is_some() {
                state.report_sequence = sequence.wrapping_add(1);
            }
            destination.map(|local| ZclMessage {
                source: address,
                source_endpoint: endpoint,
                destination_endpoint: local,
                cluster,
                direction: Direction::ServerToClient,
                transaction_sequence: sequence,
                manufacturer_code: None,
                command: ZclCommand::ReportAttributes(vec![AttributeReport {
                    attribute,
                    data_type,
                    value,
                }]),
            })
        };

        if let Some(message) = report {
            trace!(node = %address, cluster, attribute, "Simulated report");
            self.router.dispatch(&message);
        }
    }

    pub fn attribute(
        &self,
        address: IeeeAddress,
        endpoint: Endpoint,
        cluster: ClusterId,
        attribute: AttributeId,
    ) -> Option<AttributeValue> {
        self.state()
            .nodes
            .get(&address)
            .and_then(|node| node.attributes.get(&(endpoint, cluster, attribute)))
            .map(|(_, value)| value.clone())
    }

    pub fn reporting_configured(
        &self,
        address: IeeeAddress,
        endpoint: Endpoint,
        cluster: ClusterId,
        attribute: AttributeId,
    ) -> bool {
        self.state()
            .nodes
            .get(&address)
            .is_some_and(|node| node.reporting.contains_key(&(endpoint, cluster, attribute)))
    }

    /// Make the next `times` calls of `operation` on a node fail
    pub fn fail(&self, address: IeeeAddress, operation: Operation, times: u32) {
        self.state()
            .failures
            .insert((address, operation), Failure::Times(times));
    }

    /// Make every call of `operation` on a node fail
    pub fn fail_always(&self, address: IeeeAddress, operation: Operation) {
        self.state()
            .failures
            .insert((address, operation), Failure::Always);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Delay applied to every operation
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self, operation: Operation) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.operation == operation)
            .count()
    }

    /// Deliver an inbound message as if it came off the air
    pub fn inject(&self, message: &ZclMessage) -> usize {
        self.router.dispatch(message)
    }

    /// Record a request, apply latency, then decide whether it fails
    async fn begin(
        &self,
        node: &Node,
        operation: Operation,
        cluster: Option<ClusterId>,
        reporting: Option<ReportingRequest>,
    ) -> Result<(), TransportError> {
        let address = node.address();
        let latency = {
            let mut state = self.state();
            state.requests.push(RecordedRequest {
                node: address,
                operation,
                transaction_sequence: node.next_transaction_sequence(),
                cluster,
                reporting,
            });
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if !state.nodes.contains_key(&address) {
            return Err(TransportError::NodeUnreachable(address));
        }
        let key = (address, operation);
        match state.failures.get(&key).copied() {
            Some(Failure::Always) => Err(TransportError::NoAck),
            Some(Failure::Times(n)) => {
                if n <= 1 {
                    state.failures.remove(&key);
                } else {
                    state.failures.insert(key, Failure::Times(n - 1));
                }
                debug!(node = %address, ?operation, "Simulated failure");
                Err(TransportError::NoAck)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn bind(
        &self,
        node: &Node,
        _endpoints: EndpointPair,
        cluster: ClusterId,
    ) -> Result<(), TransportError> {
        self.begin(node, Operation::Bind, Some(cluster), None).await
    }

    async fn configure_reporting(
        &self,
        node: &Node,
        endpoints: EndpointPair,
        cluster: ClusterId,
        request: ReportingRequest,
    ) -> Result<(), TransportError> {
        let attribute = request.attribute;
        let cancel = request.maximum_interval == ReportingRequest::CANCEL_MAXIMUM_INTERVAL;
        self.begin(node, Operation::ConfigureReporting, Some(cluster), Some(request))
            .await?;

        let mut state = self.state();
        let Some(sim) = state.nodes.get_mut(&node.address()) else {
            return Err(TransportError::NodeUnreachable(node.address()));
        };
        let key = (endpoints.remote, cluster, attribute);
        if !sim.attributes.contains_key(&key) {
            return Err(TransportError::Status(ZclStatus::UnsupportedAttribute));
        }
        if cancel {
            sim.reporting.remove(&key);
        } else {
            sim.reporting.insert(key, endpoints.local);
        }
        Ok(())
    }

    async fn read_attributes(
        &self,
        node: &Node,
        endpoints: EndpointPair,
        cluster: ClusterId,
        attributes: &[AttributeId],
    ) -> Result<HashMap<AttributeId, ReadAttributeRecord>, TransportError> {
        self.begin(node, Operation::ReadAttributes, Some(cluster), None)
            .await?;

        let state = self.state();
        let sim = state
            .nodes
            .get(&node.address())
            .ok_or(TransportError::NodeUnreachable(node.address()))?;

        Ok(attributes
            .iter()
            .map(|&attribute| {
                let record = match sim.attributes.get(&(endpoints.remote, cluster, attribute)) {
                    Some((data_type, value)) => {
                        ReadAttributeRecord::success(attribute, *data_type, value.clone())
                    }
                    None => ReadAttributeRecord::failure(attribute, ZclStatus::UnsupportedAttribute),
                };
                (attribute, record)
            })
            .collect())
    }

    async fn send_request(&self, node: &Node, message: ZclMessage) -> Result<(), TransportError> {
        self.begin(node, Operation::SendRequest, Some(message.cluster), None)
            .await?;

        // Simulated devices act on on/off commands so state changes are observable
        if let ZclCommand::ClusterSpecific { command_id, .. } = message.command {
            if message.cluster == cluster::ON_OFF {
                let key = (message.destination_endpoint, cluster::ON_OFF, on_off::ATTR_ON_OFF);
                let current = self
                    .attribute(node.address(), key.0, key.1, key.2)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let next = match command_id {
                    on_off::CMD_OFF => Some(false),
                    on_off::CMD_ON => Some(true),
                    on_off::CMD_TOGGLE => Some(!current),
                    _ => None,
                };
                if let Some(next) = next {
                    self.set_attribute(
                        node.address(),
                        key.0,
                        key.1,
                        key.2,
                        DataType::Boolean,
                        AttributeValue::Bool(next),
                    );
                }
            }
        }
        Ok(())
    }

    async fn node_descriptor(&self, node: &Node) -> Result<NodeDescriptor, TransportError> {
        self.begin(node, Operation::NodeDescriptor, None, None).await?;
        self.state()
            .nodes
            .get(&node.address())
            .map(|sim| sim.script.descriptor)
            .ok_or(TransportError::NodeUnreachable(node.address()))
    }

    async fn active_endpoints(&self, node: &Node) -> Result<Vec<Endpoint>, TransportError> {
        self.begin(node, Operation::ActiveEndpoints, None, None).await?;
        self.state()
            .nodes
            .get(&node.address())
            .map(|sim| sim.script.endpoints.iter().map(|e| e.endpoint).collect())
            .ok_or(TransportError::NodeUnreachable(node.address()))
    }

    async fn simple_descriptor(
        &self,
        node: &Node,
        endpoint: Endpoint,
    ) -> Result<EndpointDescriptor, TransportError> {
        self.begin(node, Operation::SimpleDescriptor, None, None).await?;
        let state = self.state();
        let sim = state
            .nodes
            .get(&node.address())
            .ok_or(TransportError::NodeUnreachable(node.address()))?;
        sim.script
            .endpoints
            .iter()
            .find(|e| e.endpoint == endpoint)
            .cloned()
            .ok_or(TransportError::Status(ZclStatus::Failure))
    }

    async fn request_leave(&self, node: &Node) -> Result<(), TransportError> {
        self.begin(node, Operation::Leave, None, None).await
    }
}
