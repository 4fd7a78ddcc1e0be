//! Deterministic mapping from Cyphal ports and nodes to IPv4 endpoints.

use crate::hal::UdpEndpoint;
use crate::types::{PortId, UDP_PORT};

/// Multicast group of a subject: `239.0.x.x` with the 16-bit subject id
/// big-endian in the two low octets.
pub fn subject_endpoint(subject_id: PortId) -> UdpEndpoint {
    UdpEndpoint {
        ip: [239, 0, (subject_id >> 8) as u8, (subject_id & 0xFF) as u8],
        port: UDP_PORT,
    }
}

/// Per-destination-node group carrying all service traffic addressed to
/// that node: `239.1.x.x` with the node id big-endian in the low octets.
pub fn node_endpoint(node_id: u16) -> UdpEndpoint {
    UdpEndpoint {
        ip: [239, 1, (node_id >> 8) as u8, (node_id & 0xFF) as u8],
        port: UDP_PORT,
    }
}

// --- Unit Tests ---
