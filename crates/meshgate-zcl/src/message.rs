//! Decoded protocol messages exchanged with nodes
//!
//! Byte-level framing is the transport's business; the core only sees these
//! decoded forms.

use meshgate_core::{ClusterId, Endpoint, IeeeAddress};

use crate::types::{AttributeId, AttributeValue, DataType, Direction, ZclStatus};

/// One attribute carried by a ReportAttributes command
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeReport {
    pub attribute: AttributeId,
    pub data_type: DataType,
    pub value: AttributeValue,
}

/// One record of a ReadAttributesResponse
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAttributeRecord {
    pub attribute: AttributeId,
    pub status: ZclStatus,
    pub data_type: Option<DataType>,
    pub value: Option<AttributeValue>,
}

impl ReadAttributeRecord {
    pub fn success(attribute: AttributeId, data_type: DataType, value: AttributeValue) -> Self {
        Self {
            attribute,
            status: ZclStatus::Success,
            data_type: Some(data_type),
            value: Some(value),
        }
    }

    pub fn failure(attribute: AttributeId, status: ZclStatus) -> Self {
        Self {
            attribute,
            status,
            data_type: None,
            value: None,
        }
    }

    /// The value, if the read succeeded and carried one
    pub fn successful_value(&self) -> Option<&AttributeValue> {
        if self.status.is_success() {
            self.value.as_ref()
        } else {
            None
        }
    }
}

/// Command payload of a message
#[derive(Debug, Clone, PartialEq)]
pub enum ZclCommand {
    ReadAttributes(Vec<AttributeId>),
    ReadAttributesResponse(Vec<ReadAttributeRecord>),
    ReportAttributes(Vec<AttributeReport>),
    ConfigureReportingResponse(Vec<(AttributeId, ZclStatus)>),
    DefaultResponse { command_id: u8, status: ZclStatus },
    /// Cluster-specific command, payload left encoded
    ClusterSpecific { command_id: u8, payload: Vec<u8> },
}

/// Decoded application message
#[derive(Debug, Clone, PartialEq)]
pub struct ZclMessage {
    /// Apparent IEEE address of the sender (outbound: the destination)
    pub source: IeeeAddress,
    pub source_endpoint: Endpoint,
    pub destination_endpoint: Endpoint,
    pub cluster: ClusterId,
    pub direction: Direction,
    pub transaction_sequence: u8,
    pub manufacturer_code: Option<u16>,
    pub command: ZclCommand,
}

impl ZclMessage {
    /// Build a cluster-specific client-to-server command for a node
    pub fn command(
        node: IeeeAddress,
        local_endpoint: Endpoint,
        remote_endpoint: Endpoint,
        cluster: ClusterId,
        transaction_sequence: u8,
        command_id: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source: node,
            source_endpoint: local_endpoint,
            destination_endpoint: remote_endpoint,
            cluster,
            direction: Direction::ClientToServer,
            transaction_sequence,
            manufacturer_code: None,
            command: ZclCommand::ClusterSpecific {
                command_id,
                payload,
            },
        }
    }
}
