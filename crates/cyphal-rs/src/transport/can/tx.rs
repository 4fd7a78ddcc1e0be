//! Outbound fragmentation: one transfer into one or more CAN frames.

use crate::frame::crc::Crc16Ccitt;
use crate::frame::tail_byte::{TailByte, SOT_TOGGLE};
use crate::hal::CyphalError;
use crate::time::TimePoint;
use crate::types::TransferId;
use alloc::vec::Vec;

/// A frame waiting in a media TX queue.
#[derive(Debug)]
pub(super) struct TxFrame {
    pub can_id: u32,
    pub payload: Vec<u8>,
    pub deadline: TimePoint,
}

/// Whether `n` is a data length expressible as a CAN (FD) DLC.
fn is_valid_frame_len(n: usize) -> bool {
    n <= 8 || matches!(n, 12 | 16 | 20 | 24 | 32 | 48 | 64)
}

/// Smallest expressible frame length not below `n`.
fn round_up_frame_len(n: usize) -> usize {
    let mut len = n;
    while !is_valid_frame_len(len) {
        len += 1;
    }
    len
}

/// Splits one transfer into frames at the current MTU.
///
/// Multi-frame transfers carry the CRC-16/CCITT-FALSE of the payload
/// (including any padding) big-endian at the end of the byte stream;
/// padding zeros are inserted before the CRC so the final frame lands on
/// an expressible CAN FD length.
pub(super) fn fragment_transfer(
    can_id: u32,
    transfer_id: TransferId,
    payload: &[u8],
    mtu: usize,
    deadline: TimePoint,
) -> Result<Vec<TxFrame>, CyphalError> {
    if mtu < 8 {
        return Err(CyphalError::Argument("media MTU below the CAN minimum"));
    }
    let capacity = mtu - 1;

    if payload.len() <= capacity {
        // Single frame: no transfer CRC, padded to an expressible length.
        let frame_len = round_up_frame_len(payload.len() + 1);
        let mut data = Vec::with_capacity(frame_len);
        data.extend_from_slice(payload);
        data.resize(frame_len - 1, 0);
        data.push(TailByte::single_frame(transfer_id).into());
        return Ok(alloc::vec![TxFrame { can_id, payload: data, deadline }]);
    }

    // Pick the padding that makes the final frame expressible.
    let mut padding = 0usize;
    loop {
        let total = payload.len() + padding + Crc16Ccitt::LENGTH;
        let remainder = total % capacity;
        let last_data = if remainder == 0 { capacity } else { remainder };
        if is_valid_frame_len(last_data + 1) {
            break;
        }
        padding += 1;
    }

    let mut crc = Crc16Ccitt::new();
    crc.add_bytes(payload);
    for _ in 0..padding {
        crc.add(0);
    }

    let mut stream = Vec::with_capacity(payload.len() + padding + Crc16Ccitt::LENGTH);
    stream.extend_from_slice(payload);
    stream.resize(payload.len() + padding, 0);
    stream.extend_from_slice(&crc.get().to_be_bytes());

    let mut frames = Vec::with_capacity(stream.len().div_ceil(capacity));
    let mut toggle = SOT_TOGGLE;
    let chunk_count = stream.len().div_ceil(capacity);
    for (index, chunk) in stream.chunks(capacity).enumerate() {
        let sot = index == 0;
        let eot = index + 1 == chunk_count;
        let mut data = Vec::with_capacity(chunk.len() + 1);
        data.extend_from_slice(chunk);
        data.push(TailByte::new(sot, eot, toggle, transfer_id).into());
        frames.push(TxFrame { can_id, payload: data, deadline });
        toggle = !toggle;
    }

    Ok(frames)
}

// --- Unit Tests ---
