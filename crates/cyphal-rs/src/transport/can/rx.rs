//! Inbound reassembly: CAN frames from one source back into transfers.

use crate::frame::crc::Crc16Ccitt;
use crate::frame::tail_byte::TailByte;
use crate::time::{Duration, TimePoint};
use crate::transport::Counters;
use alloc::vec::Vec;

/// Reassembly state for one `(port, source node)` pair.
///
/// The buffer is bounded by the subscription extent (plus room for the
/// transfer CRC); bytes beyond it still feed the CRC so oversized
/// transfers validate and truncate instead of failing.
pub(crate) struct Reassembler {
    transfer_id: u8,
    next_toggle: bool,
    crc: Crc16Ccitt,
    buffer: Vec<u8>,
    total_received: usize,
    started_at: TimePoint,
    in_progress: bool,
    last_completed: Option<u8>,
}

/// A transfer completed by the last accepted frame.
pub(crate) struct CompletedTransfer {
    pub payload: Vec<u8>,
    /// Timestamp of the first frame of the transfer.
    pub timestamp: TimePoint,
    pub transfer_id: u8,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            transfer_id: 0,
            next_toggle: false,
            crc: Crc16Ccitt::new(),
            buffer: Vec::new(),
            total_received: 0,
            started_at: TimePoint::MIN,
            in_progress: false,
            last_completed: None,
        }
    }

    /// Feeds one frame (tail byte already stripped into `tail`) through
    /// the state machine. Returns the reassembled transfer when `tail`
    /// completes one.
    pub fn accept(
        &mut self,
        payload: &[u8],
        tail: TailByte,
        timestamp: TimePoint,
        extent: usize,
        transfer_id_timeout: Duration,
        counters: &mut Counters,
    ) -> Option<CompletedTransfer> {
        // Stale partial transfers are evicted lazily, when the next frame
        // for the same source arrives.
        if self.in_progress && (timestamp - self.started_at) > transfer_id_timeout {
            self.in_progress = false;
            Counters::bump(&mut counters.rx_timeouts);
        }

        if tail.sot() {
            if !tail.toggle() {
                // Start-of-transfer frames carry toggle = 1; anything else
                // is not a valid transfer of this protocol version.
                Counters::bump(&mut counters.rx_frames_rejected);
                return None;
            }
            if self.in_progress {
                // A new start discards whatever was being assembled.
                self.in_progress = false;
                Counters::bump(&mut counters.rx_out_of_sequence);
            }

            if tail.eot() {
                return self.complete_single_frame(payload, tail, timestamp, extent, counters);
            }

            self.transfer_id = tail.transfer_id();
            self.next_toggle = false;
            self.crc = Crc16Ccitt::new();
            self.crc.add_bytes(payload);
            self.buffer.clear();
            self.buffer.extend_from_slice(truncated(payload, extent + Crc16Ccitt::LENGTH));
            self.total_received = payload.len();
            self.started_at = timestamp;
            self.in_progress = true;
            return None;
        }

        // Continuation frame.
        if !self.in_progress {
            Counters::bump(&mut counters.rx_frames_rejected);
            return None;
        }
        if tail.transfer_id() != self.transfer_id || tail.toggle() != self.next_toggle {
            self.in_progress = false;
            Counters::bump(&mut counters.rx_out_of_sequence);
            return None;
        }

        self.crc.add_bytes(payload);
        let room = (extent + Crc16Ccitt::LENGTH).saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(truncated(payload, room));
        self.total_received += payload.len();
        self.next_toggle = !self.next_toggle;

        if !tail.eot() {
            return None;
        }

        self.in_progress = false;
        // Appending the big-endian CRC to the checked stream leaves a
        // zero residual.
        if self.crc.get() != 0 {
            Counters::bump(&mut counters.rx_crc_errors);
            return None;
        }
        if self.total_received < Crc16Ccitt::LENGTH {
            Counters::bump(&mut counters.rx_frames_rejected);
            return None;
        }
        if self.last_completed == Some(self.transfer_id) {
            Counters::bump(&mut counters.rx_duplicates);
            return None;
        }
        self.last_completed = Some(self.transfer_id);

        let payload_size = self.total_received - Crc16Ccitt::LENGTH;
        let mut payload = core::mem::take(&mut self.buffer);
        payload.truncate(payload_size.min(extent));
        Some(CompletedTransfer {
            payload,
            timestamp: self.started_at,
            transfer_id: self.transfer_id,
        })
    }

    fn complete_single_frame(
        &mut self,
        payload: &[u8],
        tail: TailByte,
        timestamp: TimePoint,
        extent: usize,
        counters: &mut Counters,
    ) -> Option<CompletedTransfer> {
        if self.last_completed == Some(tail.transfer_id()) {
            Counters::bump(&mut counters.rx_duplicates);
            return None;
        }
        self.last_completed = Some(tail.transfer_id());
        Some(CompletedTransfer {
            payload: truncated(payload, extent).to_vec(),
            timestamp,
            transfer_id: tail.transfer_id(),
        })
    }
}

fn truncated(bytes: &[u8], limit: usize) -> &[u8] {
    &bytes[..bytes.len().min(limit)]
}

// --- Unit Tests ---
