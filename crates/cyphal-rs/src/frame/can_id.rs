//! The 29-bit extended CAN identifier layout of Cyphal/CAN v1.
//!
//! Message transfers:
//! `[28:26] priority | [25]=0 | [24] anonymous | [23]=0 | [22:21] reserved
//! (set on transmit, ignored on reception) | [20:8] subject id | [7]=0 |
//! [6:0] source node id`.
//!
//! Service transfers:
//! `[28:26] priority | [25]=1 | [24] request-not-response | [23]=0 |
//! [22:14] service id | [13:7] destination node id | [6:0] source node id`.

use crate::hal::CyphalError;
use crate::types::{NodeId, PortId, Priority, SERVICE_ID_MAX, SUBJECT_ID_MAX};
use core::convert::TryFrom;

const OFFSET_PRIORITY: u32 = 26;
const OFFSET_SUBJECT_ID: u32 = 8;
const OFFSET_SERVICE_ID: u32 = 14;
const OFFSET_DST_NODE_ID: u32 = 7;

const FLAG_SERVICE_NOT_MESSAGE: u32 = 1 << 25;
const FLAG_ANONYMOUS_MESSAGE: u32 = 1 << 24;
const FLAG_REQUEST_NOT_RESPONSE: u32 = 1 << 24;
const FLAG_RESERVED_23: u32 = 1 << 23;
const FLAG_RESERVED_07: u32 = 1 << 7;

/// Reserved bits 21-22, set on transmitted message frames as required by
/// the protocol and masked away on reception.
const MESSAGE_RESERVED_BITS: u32 = 0b11 << 21;

const NODE_ID_MASK: u32 = 0x7F;

/// Decoded form of a Cyphal/CAN extended identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanId {
    Message {
        priority: Priority,
        subject_id: PortId,
        /// `None` for anonymous transfers; the wire field then carries a
        /// pseudo-random discriminator instead of a real address.
        source: Option<NodeId>,
    },
    Service {
        priority: Priority,
        service_id: PortId,
        source: NodeId,
        destination: NodeId,
        is_request: bool,
    },
}

impl CanId {
    pub fn priority(&self) -> Priority {
        match *self {
            CanId::Message { priority, .. } => priority,
            CanId::Service { priority, .. } => priority,
        }
    }

    /// Packs into the 29-bit wire representation.
    ///
    /// `anonymous_discriminator` fills the source field of anonymous
    /// message frames; it is ignored for addressed transfers.
    pub fn pack(&self, anonymous_discriminator: u8) -> u32 {
        match *self {
            CanId::Message { priority, subject_id, source } => {
                let source_bits = match source {
                    Some(node_id) => u32::from(node_id.0) & NODE_ID_MASK,
                    None => u32::from(anonymous_discriminator) & NODE_ID_MASK,
                };
                let anonymous_bit = if source.is_none() { FLAG_ANONYMOUS_MESSAGE } else { 0 };
                (u32::from(u8::from(priority)) << OFFSET_PRIORITY)
                    | anonymous_bit
                    | MESSAGE_RESERVED_BITS
                    | (u32::from(subject_id) << OFFSET_SUBJECT_ID)
                    | source_bits
            }
            CanId::Service { priority, service_id, source, destination, is_request } => {
                let request_bit = if is_request { FLAG_REQUEST_NOT_RESPONSE } else { 0 };
                (u32::from(u8::from(priority)) << OFFSET_PRIORITY)
                    | FLAG_SERVICE_NOT_MESSAGE
                    | request_bit
                    | (u32::from(service_id) << OFFSET_SERVICE_ID)
                    | ((u32::from(destination.0) & NODE_ID_MASK) << OFFSET_DST_NODE_ID)
                    | (u32::from(source.0) & NODE_ID_MASK)
            }
        }
    }

    /// Parses a received 29-bit identifier, rejecting frames with
    /// reserved bits set where the protocol requires them clear.
    pub fn parse(raw: u32) -> Result<CanId, CyphalError> {
        let priority = Priority::try_from(((raw >> OFFSET_PRIORITY) & 0x7) as u8)?;
        if (raw & FLAG_RESERVED_23) != 0 {
            return Err(CyphalError::InvalidFrame("reserved bit 23 set"));
        }

        if (raw & FLAG_SERVICE_NOT_MESSAGE) == 0 {
            if (raw & FLAG_RESERVED_07) != 0 {
                return Err(CyphalError::InvalidFrame("reserved bit 7 set"));
            }
            let subject_id = ((raw >> OFFSET_SUBJECT_ID) as PortId) & SUBJECT_ID_MAX;
            let source = if (raw & FLAG_ANONYMOUS_MESSAGE) != 0 {
                None
            } else {
                Some(NodeId((raw & NODE_ID_MASK) as u16))
            };
            Ok(CanId::Message { priority, subject_id, source })
        } else {
            let service_id = ((raw >> OFFSET_SERVICE_ID) as PortId) & SERVICE_ID_MAX;
            Ok(CanId::Service {
                priority,
                service_id,
                source: NodeId((raw & NODE_ID_MASK) as u16),
                destination: NodeId(((raw >> OFFSET_DST_NODE_ID) & NODE_ID_MASK) as u16),
                is_request: (raw & FLAG_REQUEST_NOT_RESPONSE) != 0,
            })
        }
    }

    /// Acceptance filter matching every frame of one subject.
    pub fn filter_for_subject(subject_id: PortId) -> crate::hal::Filter {
        crate::hal::Filter {
            id: u32::from(subject_id) << OFFSET_SUBJECT_ID,
            mask: FLAG_SERVICE_NOT_MESSAGE
                | FLAG_RESERVED_07
                | (u32::from(SUBJECT_ID_MAX) << OFFSET_SUBJECT_ID),
        }
    }

    /// Acceptance filter matching every service frame addressed to the
    /// given local node.
    pub fn filter_for_services(local_node_id: NodeId) -> crate::hal::Filter {
        crate::hal::Filter {
            id: FLAG_SERVICE_NOT_MESSAGE
                | ((u32::from(local_node_id.0) & NODE_ID_MASK) << OFFSET_DST_NODE_ID),
            mask: FLAG_SERVICE_NOT_MESSAGE
                | FLAG_RESERVED_23
                | (NODE_ID_MASK << OFFSET_DST_NODE_ID),
        }
    }
}

// --- Unit Tests ---
