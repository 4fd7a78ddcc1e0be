//! Inbound reassembly: datagrams from one `(source, transfer)` back into
//! a transfer.

use crate::frame::crc::Crc32C;
use crate::frame::udp_header::UdpHeader;
use crate::time::{Duration, TimePoint};
use crate::transport::Counters;
use crate::types::TransferId;
use alloc::vec::Vec;

/// Feeds a byte stream into a CRC while withholding the trailing four
/// bytes, which carry the transmitted payload CRC.
struct DelayedCrc32 {
    crc: Crc32C,
    window: [u8; Crc32C::LENGTH],
    filled: usize,
}

impl DelayedCrc32 {
    fn new() -> Self {
        DelayedCrc32 { crc: Crc32C::new(), window: [0; Crc32C::LENGTH], filled: 0 }
    }

    /// Pushes one byte; returns the byte leaving the delay line, which is
    /// known to be payload rather than trailer.
    fn push(&mut self, byte: u8) -> Option<u8> {
        if self.filled < self.window.len() {
            self.window[self.filled] = byte;
            self.filled += 1;
            return None;
        }
        let out = self.window[0];
        self.window.copy_within(1.., 0);
        self.window[3] = byte;
        self.crc.add(out);
        Some(out)
    }

    /// Computed and stored CRC, or `None` if the stream was shorter than
    /// the trailer itself.
    fn finish(&self) -> Option<(u32, u32)> {
        if self.filled < self.window.len() {
            return None;
        }
        Some((self.crc.get(), u32::from_le_bytes(self.window)))
    }
}

pub(crate) struct CompletedTransfer {
    pub payload: Vec<u8>,
    /// Timestamp of the first datagram of the transfer.
    pub timestamp: TimePoint,
    pub transfer_id: TransferId,
}

/// Reassembly state for one source node within a session.
pub(crate) struct UdpReassembler {
    transfer_id: TransferId,
    next_frame_index: u32,
    crc: DelayedCrc32,
    buffer: Vec<u8>,
    started_at: TimePoint,
    in_progress: bool,
    last_completed: Option<TransferId>,
}

impl UdpReassembler {
    pub fn new() -> Self {
        UdpReassembler {
            transfer_id: 0,
            next_frame_index: 0,
            crc: DelayedCrc32::new(),
            buffer: Vec::new(),
            started_at: TimePoint::MIN,
            in_progress: false,
            last_completed: None,
        }
    }

    pub fn accept(
        &mut self,
        header: &UdpHeader,
        payload: &[u8],
        timestamp: TimePoint,
        extent: usize,
        transfer_id_timeout: Duration,
        counters: &mut Counters,
    ) -> Option<CompletedTransfer> {
        if self.in_progress && (timestamp - self.started_at) > transfer_id_timeout {
            self.in_progress = false;
            Counters::bump(&mut counters.rx_timeouts);
        }

        if header.frame_index == 0 {
            if self.in_progress {
                self.in_progress = false;
                Counters::bump(&mut counters.rx_out_of_sequence);
            }
            self.transfer_id = header.transfer_id;
            self.next_frame_index = 0;
            self.crc = DelayedCrc32::new();
            self.buffer.clear();
            self.started_at = timestamp;
            self.in_progress = true;
        } else if !self.in_progress
            || header.transfer_id != self.transfer_id
            || header.frame_index != self.next_frame_index
        {
            // A gap in the index sequence kills the whole transfer; there
            // is no way to patch a hole later.
            self.in_progress = false;
            Counters::bump(&mut counters.rx_out_of_sequence);
            return None;
        }

        for &byte in payload {
            if let Some(out) = self.crc.push(byte) {
                if self.buffer.len() < extent {
                    self.buffer.push(out);
                }
            }
        }
        self.next_frame_index += 1;

        if !header.end_of_transfer {
            return None;
        }

        self.in_progress = false;
        let Some((computed, stored)) = self.crc.finish() else {
            Counters::bump(&mut counters.rx_frames_rejected);
            return None;
        };
        if computed != stored {
            Counters::bump(&mut counters.rx_crc_errors);
            return None;
        }
        if self.last_completed == Some(self.transfer_id) {
            Counters::bump(&mut counters.rx_duplicates);
            return None;
        }
        self.last_completed = Some(self.transfer_id);

        Some(CompletedTransfer {
            payload: core::mem::take(&mut self.buffer),
            timestamp: self.started_at,
            transfer_id: self.transfer_id,
        })
    }
}

// --- Unit Tests ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::udp_header::DataSpecifier;
    use crate::types::Priority;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn header(transfer_id: TransferId, frame_index: u32, eot: bool) -> UdpHeader {
        UdpHeader {
            priority: Priority::Nominal,
            source: 7,
            destination: 0xFFFF,
            data_specifier: DataSpecifier::Subject(5),
            transfer_id,
            frame_index,
            end_of_transfer: eot,
        }
    }

    fn with_crc(payload: &[u8]) -> Vec<u8> {
        let mut crc = Crc32C::new();
        crc.add_bytes(payload);
        let mut stream = payload.to_vec();
        stream.extend_from_slice(&crc.get().to_le_bytes());
        stream
    }

    #[test]
    fn test_single_datagram_round_trip() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let stream = with_crc(b"hello");
        let transfer = reassembler
            .accept(&header(9, 0, true), &stream, TimePoint::from_micros(5), 64, TIMEOUT, &mut counters)
            .unwrap();
        assert_eq!(transfer.payload, b"hello");
        assert_eq!(transfer.transfer_id, 9);
        assert_eq!(transfer.timestamp, TimePoint::from_micros(5));
    }

    #[test]
    fn test_crc_straddles_datagrams() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let stream = with_crc(b"abcdef");
        // Split so that two CRC bytes land in each datagram.
        let (first, second) = stream.split_at(8);
        let t0 = TimePoint::from_micros(0);
        assert!(reassembler.accept(&header(1, 0, false), first, t0, 64, TIMEOUT, &mut counters).is_none());
        let transfer =
            reassembler.accept(&header(1, 1, true), second, t0, 64, TIMEOUT, &mut counters).unwrap();
        assert_eq!(transfer.payload, b"abcdef");
    }

    #[test]
    fn test_extent_truncation() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let stream = with_crc(&[0xAB; 12]);
        let transfer = reassembler
            .accept(&header(0, 0, true), &stream, TimePoint::MIN, 8, TIMEOUT, &mut counters)
            .unwrap();
        assert_eq!(transfer.payload, [0xAB; 8]);
    }

    #[test]
    fn test_corrupted_payload_counted() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let mut stream = with_crc(b"hello");
        stream[1] ^= 0xFF;
        assert!(reassembler
            .accept(&header(0, 0, true), &stream, TimePoint::MIN, 64, TIMEOUT, &mut counters)
            .is_none());
        assert_eq!(counters.rx_crc_errors, 1);
    }

    #[test]
    fn test_missing_middle_datagram_then_recovery() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let stream = with_crc(&[7u8; 30]);
        let t0 = TimePoint::from_micros(0);

        // Frames 0 and 2 arrive; 1 is lost.
        reassembler.accept(&header(3, 0, false), &stream[..10], t0, 64, TIMEOUT, &mut counters);
        assert!(reassembler
            .accept(&header(3, 2, true), &stream[20..], t0, 64, TIMEOUT, &mut counters)
            .is_none());
        assert_eq!(counters.rx_out_of_sequence, 1);

        // The same transfer id reassembles fine afterwards.
        let later = t0 + Duration::from_secs(3);
        reassembler.accept(&header(3, 0, false), &stream[..10], later, 64, TIMEOUT, &mut counters);
        reassembler.accept(&header(3, 1, false), &stream[10..20], later, 64, TIMEOUT, &mut counters);
        let transfer = reassembler
            .accept(&header(3, 2, true), &stream[20..], later, 64, TIMEOUT, &mut counters)
            .unwrap();
        assert_eq!(transfer.payload, [7u8; 30]);
    }

    #[test]
    fn test_duplicate_transfer_suppressed() {
        let mut reassembler = UdpReassembler::new();
        let mut counters = Counters::default();
        let stream = with_crc(b"x");
        let t0 = TimePoint::from_micros(0);
        assert!(reassembler.accept(&header(4, 0, true), &stream, t0, 64, TIMEOUT, &mut counters).is_some());
        assert!(reassembler.accept(&header(4, 0, true), &stream, t0, 64, TIMEOUT, &mut counters).is_none());
        assert_eq!(counters.rx_duplicates, 1);
    }
}
