//! Shared test harness: a virtual CAN bus, a virtual UDP network, and
//! simulated media driven by a manually advanced clock.

// Not every suite exercises every helper.
#![allow(dead_code)]

pub mod interface;
pub mod udp;

pub use interface::{SimulatedCanMedia, VirtualCanBus};
pub use udp::{SimulatedUdpMedia, VirtualUdpNetwork};

use cyphal_rs::hal::CyphalError;
use cyphal_rs::presentation::DataType;
use cyphal_rs::time::{Duration, ManualClock};
use cyphal_rs::Executor;

/// Advances simulated time in small steps, spinning the executor after
/// each step, until `total` has elapsed.
pub fn run_for(executor: &Executor, clock: &ManualClock, total: Duration) {
    const STEP_US: i64 = 100;
    let mut remaining = total.as_micros();
    executor.spin_once();
    while remaining > 0 {
        let step = remaining.min(STEP_US);
        clock.advance(Duration::from_micros(step));
        remaining -= step;
        executor.spin_once();
    }
}

/// A small fixed-layout test message: one `u32` counter and a blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestRecord {
    pub counter: u32,
    pub blob: Vec<u8>,
}

impl DataType for TestRecord {
    const EXTENT_BYTES: usize = 64;

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError> {
        let size = 4 + self.blob.len();
        if buffer.len() < size {
            return Err(CyphalError::Serialization);
        }
        buffer[..4].copy_from_slice(&self.counter.to_le_bytes());
        buffer[4..size].copy_from_slice(&self.blob);
        Ok(size)
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError> {
        // Truncated buffers zero-extend, as the data model prescribes.
        let mut counter_bytes = [0u8; 4];
        let n = buffer.len().min(4);
        counter_bytes[..n].copy_from_slice(&buffer[..n]);
        Ok(TestRecord {
            counter: u32::from_le_bytes(counter_bytes),
            blob: buffer.get(4..).map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }
}

/// Raw byte payload with a tiny extent, for truncation tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmallBlob(pub Vec<u8>);

impl DataType for SmallBlob {
    const EXTENT_BYTES: usize = 8;

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError> {
        if buffer.len() < self.0.len() {
            return Err(CyphalError::Serialization);
        }
        buffer[..self.0.len()].copy_from_slice(&self.0);
        Ok(self.0.len())
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError> {
        Ok(SmallBlob(buffer.to_vec()))
    }
}

/// Raw byte payload with a roomy extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeBlob(pub Vec<u8>);

impl DataType for LargeBlob {
    const EXTENT_BYTES: usize = 64;

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError> {
        if buffer.len() < self.0.len() {
            return Err(CyphalError::Serialization);
        }
        buffer[..self.0.len()].copy_from_slice(&self.0);
        Ok(self.0.len())
    }

    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError> {
        Ok(LargeBlob(buffer.to_vec()))
    }
}
