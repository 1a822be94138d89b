//! Meshgate ZCL - Protocol vocabulary and transport interface
//!
//! The gateway core talks to the radio network only through the
//! [`Transport`] trait and receives inbound frames through a
//! [`MessageRouter`]. Framing and the radio driver live behind those seams.

pub mod message;
pub mod query;
pub mod router;
pub mod sim;
pub mod transport;
pub mod types;

pub use message::{AttributeReport, ReadAttributeRecord, ZclCommand, ZclMessage};
pub use query::{
    query_active_endpoints, query_node_descriptor, query_simple_descriptor, retry, RetryPolicy,
};
pub use router::{ListenerId, MessageRouter};
pub use sim::{Operation, RecordedRequest, SimulatedNode, SimulatedTransport};
pub use transport::{with_deadline, ReportingRequest, Transport, TransportError, DEFAULT_TIMEOUT_MS};
pub use types::{AttributeId, AttributeValue, DataType, Direction, EndpointPair, ZclStatus};
