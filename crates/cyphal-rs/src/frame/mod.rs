//! Wire-level codecs shared by the transports: the 29-bit CAN identifier
//! layout, the CAN tail byte, the Cyphal/UDP datagram header, and the
//! transfer CRC functions.

pub mod can_id;
pub mod codec;
pub mod crc;
pub mod tail_byte;
pub mod udp_header;

pub use can_id::CanId;
pub use codec::Codec;
pub use crc::{Crc16Ccitt, Crc32C};
pub use tail_byte::TailByte;
pub use udp_header::{DataSpecifier, UdpHeader};
