//! Transport interface to the radio network
//!
//! Implementations own framing and the radio driver. Every operation is an
//! awaitable round-trip; callers bound them with [`with_deadline`], so an
//! implementation must tolerate being dropped mid-flight.

use async_trait::async_trait;
use meshgate_core::{ClusterId, Endpoint, EndpointDescriptor, IeeeAddress, Node, NodeDescriptor};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::message::{ReadAttributeRecord, ZclMessage};
use crate::types::{AttributeId, AttributeValue, DataType, EndpointPair, ZclStatus};

/// Default per-operation deadline
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("No acknowledgement from node")]
    NoAck,
    #[error("Node {0} not reachable")]
    NodeUnreachable(IeeeAddress),
    #[error("Request rejected with status {0}")]
    Status(ZclStatus),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Parameters of a configure-reporting request
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingRequest {
    pub attribute: AttributeId,
    pub data_type: DataType,
    /// Seconds
    pub minimum_interval: u16,
    /// Seconds; 0xFFFF cancels reporting
    pub maximum_interval: u16,
    pub reportable_change: Option<AttributeValue>,
}

impl ReportingRequest {
    pub const CANCEL_MINIMUM_INTERVAL: u16 = 0x0000;
    pub const CANCEL_MAXIMUM_INTERVAL: u16 = 0xFFFF;

    /// Request that stops a device reporting the attribute
    pub fn cancel(attribute: AttributeId, data_type: DataType) -> Self {
        Self {
            attribute,
            data_type,
            minimum_interval: Self::CANCEL_MINIMUM_INTERVAL,
            maximum_interval: Self::CANCEL_MAXIMUM_INTERVAL,
            reportable_change: None,
        }
    }
}

/// Round-trip operations the gateway core needs from the network.
///
/// Implementations draw transaction sequence numbers from
/// [`Node::next_transaction_sequence`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a binding from the device's cluster to the gateway
    async fn bind(
        &self,
        node: &Node,
        endpoints: EndpointPair,
        cluster: ClusterId,
    ) -> Result<(), TransportError>;

    async fn configure_reporting(
        &self,
        node: &Node,
        endpoints: EndpointPair,
        cluster: ClusterId,
        request: ReportingRequest,
    ) -> Result<(), TransportError>;

    async fn read_attributes(
        &self,
        node: &Node,
        endpoints: EndpointPair,
        cluster: ClusterId,
        attributes: &[AttributeId],
    ) -> Result<HashMap<AttributeId, ReadAttributeRecord>, TransportError>;

    /// Send an arbitrary message, waiting only for delivery
    async fn send_request(&self, node: &Node, message: ZclMessage) -> Result<(), TransportError>;

    async fn node_descriptor(&self, node: &Node) -> Result<NodeDescriptor, TransportError>;

    async fn active_endpoints(&self, node: &Node) -> Result<Vec<Endpoint>, TransportError>;

    async fn simple_descriptor(
        &self,
        node: &Node,
        endpoint: Endpoint,
    ) -> Result<EndpointDescriptor, TransportError>;

    /// Ask a node to leave the network
    async fn request_leave(&self, node: &Node) -> Result<(), TransportError>;
}

/// Run a transport operation under a deadline
pub async fn with_deadline<T, F>(deadline: Duration, operation: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(deadline)),
    }
}
