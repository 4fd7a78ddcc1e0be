#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (payload buffers, session tables).
extern crate alloc;

// --- Foundation Modules ---
pub mod hal;
pub mod time;
pub mod types;

// --- Scheduling ---
pub mod executor;

// --- Wire formats ---
pub mod frame;

// --- Transport layer (CAN and UDP) ---
pub mod transport;

// --- Typed presentation layer ---
pub mod presentation;

// Export core types and the media abstraction.
pub use executor::{Callback, Executor, SpinResult};
pub use hal::{CanMedia, CyphalError, Filter, MediaError, UdpMedia};
pub use time::{Clock, Duration, TimePoint};
pub use types::{NodeId, PortId, Priority, TransferId, TransferKind};
