//! The fixed 24-byte Cyphal/UDP datagram header.
//!
//! All fields little-endian: version (1 byte), priority (1 byte), source
//! node id (u16), destination node id (u16), data specifier (u16),
//! transfer id (u64), frame index with the end-of-transfer flag in the
//! top bit (u32), user data (u16, zero), header CRC-16/CCITT-FALSE over
//! the preceding 22 bytes (u16).

use crate::frame::codec::Codec;
use crate::frame::crc::Crc16Ccitt;
use crate::hal::CyphalError;
use crate::types::{PortId, Priority, TransferId, SERVICE_ID_MAX, SUBJECT_ID_MAX};
use core::convert::TryFrom;

pub const HEADER_SIZE: usize = 24;
pub const PROTOCOL_VERSION: u8 = 1;

const DATA_SPECIFIER_SERVICE: u16 = 1 << 15;
const DATA_SPECIFIER_REQUEST: u16 = 1 << 14;
const FRAME_INDEX_EOT: u32 = 1 << 31;

/// What the datagram carries: a subject message or one leg of a service
/// call. Encoded in the 16-bit data-specifier field (bit 15 service flag,
/// bit 14 request flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataSpecifier {
    Subject(PortId),
    ServiceRequest(PortId),
    ServiceResponse(PortId),
}

impl DataSpecifier {
    pub fn port_id(&self) -> PortId {
        match *self {
            DataSpecifier::Subject(id)
            | DataSpecifier::ServiceRequest(id)
            | DataSpecifier::ServiceResponse(id) => id,
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            DataSpecifier::Subject(id) => id,
            DataSpecifier::ServiceRequest(id) => DATA_SPECIFIER_SERVICE | DATA_SPECIFIER_REQUEST | id,
            DataSpecifier::ServiceResponse(id) => DATA_SPECIFIER_SERVICE | id,
        }
    }

    fn from_wire(raw: u16) -> Result<Self, CyphalError> {
        if (raw & DATA_SPECIFIER_SERVICE) == 0 {
            if raw > SUBJECT_ID_MAX {
                return Err(CyphalError::InvalidFrame("subject id out of range"));
            }
            Ok(DataSpecifier::Subject(raw))
        } else {
            let id = raw & !(DATA_SPECIFIER_SERVICE | DATA_SPECIFIER_REQUEST);
            if id > SERVICE_ID_MAX {
                return Err(CyphalError::InvalidFrame("service id out of range"));
            }
            if (raw & DATA_SPECIFIER_REQUEST) != 0 {
                Ok(DataSpecifier::ServiceRequest(id))
            } else {
                Ok(DataSpecifier::ServiceResponse(id))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub priority: Priority,
    /// Raw node id; 0xFFFF means anonymous (source) or broadcast
    /// (destination).
    pub source: u16,
    pub destination: u16,
    pub data_specifier: DataSpecifier,
    pub transfer_id: TransferId,
    /// Index of this datagram within the transfer, starting at zero.
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

impl Codec for UdpHeader {
    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError> {
        if buffer.len() < HEADER_SIZE {
            return Err(CyphalError::BufferTooShort);
        }

        buffer[0] = PROTOCOL_VERSION;
        buffer[1] = u8::from(self.priority);
        buffer[2..4].copy_from_slice(&self.source.to_le_bytes());
        buffer[4..6].copy_from_slice(&self.destination.to_le_bytes());
        buffer[6..8].copy_from_slice(&self.data_specifier.to_wire().to_le_bytes());
        buffer[8..16].copy_from_slice(&self.transfer_id.to_le_bytes());
        let index_eot =
            (self.frame_index & !FRAME_INDEX_EOT) | if self.end_of_transfer { FRAME_INDEX_EOT } else { 0 };
        buffer[16..20].copy_from_slice(&index_eot.to_le_bytes());
        buffer[20..22].copy_from_slice(&0u16.to_le_bytes());

        let mut crc = Crc16Ccitt::new();
        crc.add_bytes(&buffer[..22]);
        buffer[22..24].copy_from_slice(&crc.get().to_le_bytes());

        Ok(HEADER_SIZE)
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError> {
        if buffer.len() < HEADER_SIZE {
            return Err(CyphalError::BufferTooShort);
        }
        if buffer[0] != PROTOCOL_VERSION {
            return Err(CyphalError::InvalidFrame("unsupported header version"));
        }

        let mut crc = Crc16Ccitt::new();
        crc.add_bytes(&buffer[..22]);
        let stored = u16::from_le_bytes(buffer[22..24].try_into().map_err(|_| CyphalError::BufferTooShort)?);
        if crc.get() != stored {
            return Err(CyphalError::InvalidFrame("header CRC mismatch"));
        }

        let index_eot =
            u32::from_le_bytes(buffer[16..20].try_into().map_err(|_| CyphalError::BufferTooShort)?);

        Ok(UdpHeader {
            priority: Priority::try_from(buffer[1])?,
            source: u16::from_le_bytes(buffer[2..4].try_into().map_err(|_| CyphalError::BufferTooShort)?),
            destination: u16::from_le_bytes(
                buffer[4..6].try_into().map_err(|_| CyphalError::BufferTooShort)?,
            ),
            data_specifier: DataSpecifier::from_wire(u16::from_le_bytes(
                buffer[6..8].try_into().map_err(|_| CyphalError::BufferTooShort)?,
            ))?,
            transfer_id: TransferId::from_le_bytes(
                buffer[8..16].try_into().map_err(|_| CyphalError::BufferTooShort)?,
            ),
            frame_index: index_eot & !FRAME_INDEX_EOT,
            end_of_transfer: (index_eot & FRAME_INDEX_EOT) != 0,
        })
    }
}

// --- Unit Tests ---
