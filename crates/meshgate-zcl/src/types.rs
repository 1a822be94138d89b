//! Cluster library vocabulary: identifiers, statuses, data types, values

use meshgate_core::Endpoint;
use serde::{Deserialize, Serialize};

pub use meshgate_core::ClusterId;

/// Attribute identifier within a cluster
pub type AttributeId = u16;

/// Common cluster IDs
pub mod cluster {
    use super::ClusterId;

    pub const BASIC: ClusterId = 0x0000;
    pub const POWER_CONFIG: ClusterId = 0x0001;
    pub const IDENTIFY: ClusterId = 0x0003;
    pub const GROUPS: ClusterId = 0x0004;
    pub const SCENES: ClusterId = 0x0005;
    pub const ON_OFF: ClusterId = 0x0006;
    pub const LEVEL_CONTROL: ClusterId = 0x0008;
    pub const OTA_UPGRADE: ClusterId = 0x0019;
    pub const COLOR_CONTROL: ClusterId = 0x0300;
    pub const TEMPERATURE_MEASUREMENT: ClusterId = 0x0402;
    pub const HUMIDITY_MEASUREMENT: ClusterId = 0x0405;
    pub const OCCUPANCY_SENSING: ClusterId = 0x0406;
    pub const ELECTRICAL_MEASUREMENT: ClusterId = 0x0B04;
}

/// On/Off cluster attributes and commands
pub mod on_off {
    use super::AttributeId;

    pub const ATTR_ON_OFF: AttributeId = 0x0000;

    pub const CMD_OFF: u8 = 0x00;
    pub const CMD_ON: u8 = 0x01;
    pub const CMD_TOGGLE: u8 = 0x02;
}

/// Home automation profile
pub const PROFILE_HOME_AUTOMATION: u16 = 0x0104;

/// Endpoint the gateway itself exposes by default
pub const DEFAULT_GATEWAY_ENDPOINT: Endpoint = 0x01;

/// Local (gateway) and remote (device) endpoint of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl EndpointPair {
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }
}

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Status codes carried in responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZclStatus {
    Success,
    Failure,
    UnsupportedAttribute,
    UnreportableAttribute,
    InvalidDataType,
    Timeout,
    Other(u8),
}

impl ZclStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Failure,
            0x86 => Self::UnsupportedAttribute,
            0x8c => Self::UnreportableAttribute,
            0x8d => Self::InvalidDataType,
            0x94 => Self::Timeout,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Failure => 0x01,
            Self::UnsupportedAttribute => 0x86,
            Self::UnreportableAttribute => 0x8c,
            Self::InvalidDataType => 0x8d,
            Self::Timeout => 0x94,
            Self::Other(v) => *v,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl std::fmt::Display for ZclStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:02x})", self, self.as_u8())
    }
}

/// Attribute data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    NoData = 0x00,
    Boolean = 0x10,
    Bitmap8 = 0x18,
    Bitmap16 = 0x19,
    Uint8 = 0x20,
    Uint16 = 0x21,
    Uint24 = 0x22,
    Uint32 = 0x23,
    Int8 = 0x28,
    Int16 = 0x29,
    Int32 = 0x2B,
    Enum8 = 0x30,
    Enum16 = 0x31,
    Float32 = 0x39,
    String = 0x42,
    Ieee = 0xF0,
}

impl DataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::NoData,
            0x10 => Self::Boolean,
            0x18 => Self::Bitmap8,
            0x19 => Self::Bitmap16,
            0x20 => Self::Uint8,
            0x21 => Self::Uint16,
            0x22 => Self::Uint24,
            0x23 => Self::Uint32,
            0x28 => Self::Int8,
            0x29 => Self::Int16,
            0x2B => Self::Int32,
            0x30 => Self::Enum8,
            0x31 => Self::Enum16,
            0x39 => Self::Float32,
            0x42 => Self::String,
            0xF0 => Self::Ieee,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Whether a reportable-change threshold applies to this type
    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Uint16
                | Self::Uint24
                | Self::Uint32
                | Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Float32
        )
    }
}

/// Decoded attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => Some(*v),
            Self::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Signed(v) => Some(*v),
            Self::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ZclStatus::from_u8(0x86), ZclStatus::UnsupportedAttribute);
        assert_eq!(ZclStatus::from_u8(0x42), ZclStatus::Other(0x42));
        assert_eq!(ZclStatus::Other(0x42).as_u8(), 0x42);
        assert!(ZclStatus::from_u8(0).is_success());
    }

    #[test]
    fn test_data_types() {
        assert_eq!(DataType::from_u8(0x21), Some(DataType::Uint16));
        assert_eq!(DataType::from_u8(0x77), None);
        assert_eq!(DataType::Int16.as_u8(), 0x29);
        assert!(DataType::Int16.is_analog());
        assert!(!DataType::Boolean.is_analog());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(AttributeValue::Signed(-4).as_u64(), None);
        assert_eq!(AttributeValue::Unsigned(7).as_i64(), Some(7));
        assert_eq!(AttributeValue::Bool(true).as_bool(), Some(true));
    }
}
