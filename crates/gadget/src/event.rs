//! Events and raw control notifications
//!
//! The control channel yields fixed-size kernel records. [`Notification`]
//! is the decoded record; [`Event`] is the closed set of lifecycle signals
//! handed to the session callback.

use crate::endian::wire_to_host16;
use crate::error::{GadgetError, Result};

/// Lifecycle event delivered to the session callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Endpoint became usable under the active configuration
    EndpointEnable(u8),
    /// Endpoint was deactivated; its handle is already closed
    EndpointDisable(u8),
    Connect,
    /// Host went away; every enabled endpoint has been disabled
    Disconnect,
    Suspend,
}

impl Event {
    /// Endpoint number carried by enable/disable events
    pub fn endpoint(&self) -> Option<u8> {
        match self {
            Self::EndpointEnable(n) | Self::EndpointDisable(n) => Some(*n),
            _ => None,
        }
    }
}

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    #[default]
    Unknown,
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
    Wireless,
    /// 5 Gbps
    Super,
    /// 10 Gbps
    SuperPlus,
}

impl Speed {
    fn from_kernel(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    fn to_kernel(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }

    /// Whether high-speed descriptors apply
    pub fn is_high_or_faster(self) -> bool {
        matches!(
            self,
            Self::High | Self::Wireless | Self::Super | Self::SuperPlus
        )
    }
}

/// Standard request codes
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0a;
    pub const SET_INTERFACE: u8 = 0x0b;
}

const REQUEST_TYPE_MASK: u8 = 0x60;
const REQUEST_TYPE_STANDARD: u8 = 0x00;
const REQUEST_DIR_IN: u8 = 0x80;

/// 8-byte control request from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |at: usize| wire_to_host16(u16::from_ne_bytes([bytes[at], bytes[at + 1]]));
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: field(2),
            index: field(4),
            length: field(6),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.request_type;
        buf[1] = self.request;
        buf[2..4].copy_from_slice(&self.value.to_le_bytes());
        buf[4..6].copy_from_slice(&self.index.to_le_bytes());
        buf[6..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Data stage flows device to host
    pub fn is_in(&self) -> bool {
        self.request_type & REQUEST_DIR_IN != 0
    }

    /// Standard (chapter 9) request rather than class or vendor
    pub fn is_standard(&self) -> bool {
        self.request_type & REQUEST_TYPE_MASK == REQUEST_TYPE_STANDARD
    }

    /// Standard SET_CONFIGURATION request
    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: 0x00,
            request: request::SET_CONFIGURATION,
            value: u16::from(value),
            index: 0,
            length: 0,
        }
    }

    /// Standard GET_DESCRIPTOR(STRING) request
    pub fn get_string(index: u8, language: u16, length: u16) -> Self {
        Self {
            request_type: REQUEST_DIR_IN,
            request: request::GET_DESCRIPTOR,
            value: (u16::from(crate::descriptor::DT_STRING) << 8) | u16::from(index),
            index: language,
            length,
        }
    }
}

/// Decoded control-channel record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Nop,
    Connect(Speed),
    Disconnect,
    Setup(SetupPacket),
    Suspend,
}

const KIND_NOP: u32 = 0;
const KIND_CONNECT: u32 = 1;
const KIND_DISCONNECT: u32 = 2;
const KIND_SETUP: u32 = 3;
const KIND_SUSPEND: u32 = 4;

impl Notification {
    /// Size of one kernel record: 8-byte payload, then a 4-byte kind
    pub const SIZE: usize = 12;

    /// Decode one record
    pub fn decode(record: &[u8]) -> Result<Self> {
        let record: &[u8; Self::SIZE] = record.try_into().map_err(|_| {
            GadgetError::Decode(format!(
                "record is {} bytes, expected {}",
                record.len(),
                Self::SIZE
            ))
        })?;
        let mut payload = [0u8; SetupPacket::SIZE];
        payload.copy_from_slice(&record[..SetupPacket::SIZE]);
        let kind = u32::from_ne_bytes([record[8], record[9], record[10], record[11]]);

        match kind {
            KIND_NOP => Ok(Self::Nop),
            KIND_CONNECT => {
                let raw = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Self::Connect(Speed::from_kernel(raw)))
            }
            KIND_DISCONNECT => Ok(Self::Disconnect),
            KIND_SETUP => Ok(Self::Setup(SetupPacket::parse(&payload))),
            KIND_SUSPEND => Ok(Self::Suspend),
            other => Err(GadgetError::Decode(format!(
                "unknown notification kind {}",
                other
            ))),
        }
    }

    /// Encode as a kernel record (the inverse of [`decode`](Self::decode))
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut record = [0u8; Self::SIZE];
        let kind = match self {
            Self::Nop => KIND_NOP,
            Self::Connect(speed) => {
                record[..4].copy_from_slice(&speed.to_kernel().to_ne_bytes());
                KIND_CONNECT
            }
            Self::Disconnect => KIND_DISCONNECT,
            Self::Setup(setup) => {
                record[..8].copy_from_slice(&setup.to_bytes());
                KIND_SETUP
            }
            Self::Suspend => KIND_SUSPEND,
        };
        record[8..].copy_from_slice(&kind.to_ne_bytes());
        record
    }
}

/// Build a record with an arbitrary kind code
pub fn raw_record(kind: u32, payload: [u8; 8]) -> [u8; Notification::SIZE] {
    let mut record = [0u8; Notification::SIZE];
    record[..8].copy_from_slice(&payload);
    record[8..].copy_from_slice(&kind.to_ne_bytes());
    record
}
