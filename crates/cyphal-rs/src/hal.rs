use crate::executor::Callback;
use crate::time::TimePoint;
use crate::types::{NodeIdError, PriorityError};
use alloc::boxed::Box;
use core::fmt;

/// Opaque failure reported by a media implementation. The numeric code is
/// media-specific (e.g. an errno) and is only logged by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaError {
    pub code: i32,
}

impl MediaError {
    pub const fn new(code: i32) -> Self {
        MediaError { code }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media failure (code {})", self.code)
    }
}

/// Defines a portable, descriptive error type for the whole stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyphalError {
    /// A bounded pool or table cannot accommodate another entry.
    OutOfMemory,
    /// The TX queue is full; the caller may retry later.
    Capacity,
    /// A session for this port (and peer, for services) is already open.
    AlreadyExists,
    /// The feature is stubbed out for the selected media.
    NotImplemented,
    /// Caller-supplied parameters violate the protocol (message names the offender).
    Argument(&'static str),
    /// An underlying media operation failed.
    Media(MediaError),
    /// A service response did not arrive before its deadline.
    Timeout,
    /// The payload codec rejected the data.
    Serialization,
    /// The provided buffer is too small for the operation.
    BufferTooShort,
    /// A received frame is not a valid Cyphal frame (message names the check).
    InvalidFrame(&'static str),
}

impl fmt::Display for CyphalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::Capacity => write!(f, "TX queue capacity exhausted"),
            Self::AlreadyExists => write!(f, "Session already exists for this port"),
            Self::NotImplemented => write!(f, "Not implemented for this media"),
            Self::Argument(what) => write!(f, "Invalid argument: {}", what),
            Self::Media(e) => write!(f, "{}", e),
            Self::Timeout => write!(f, "Response deadline expired"),
            Self::Serialization => write!(f, "Payload (de)serialization failed"),
            Self::BufferTooShort => write!(f, "Buffer is too short"),
            Self::InvalidFrame(what) => write!(f, "Invalid frame: {}", what),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CyphalError {}

// --- From Implementations for Error Conversion ---

impl From<MediaError> for CyphalError {
    fn from(e: MediaError) -> Self {
        CyphalError::Media(e)
    }
}

impl From<NodeIdError> for CyphalError {
    fn from(_: NodeIdError) -> Self {
        CyphalError::Argument("node id out of range")
    }
}

impl From<PriorityError> for CyphalError {
    fn from(_: PriorityError) -> Self {
        CyphalError::InvalidFrame("priority field out of range")
    }
}

/// An acceptance filter entry for the CAN hardware, 29-bit extended ids.
/// A frame passes if `(frame_id & mask) == (id & mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

/// Metadata of a CAN frame taken from the media reception queue.
#[derive(Debug, Clone, Copy)]
pub struct CanFrameMeta {
    /// Reception timestamp as observed by the media.
    pub timestamp: TimePoint,
    /// 29-bit extended CAN id.
    pub can_id: u32,
    /// Number of payload bytes written into the caller's buffer.
    pub payload_size: usize,
}

/// Hardware abstraction for a single CAN bus interface (classic or FD).
///
/// Implementations are supplied by the embedder; the core never touches
/// the wire directly. All operations are non-blocking.
pub trait CanMedia {
    /// Current maximum data-field size of a frame. May change at any time
    /// (e.g. FD negotiation); the transport re-queries it per transfer.
    fn mtu(&self) -> usize;

    /// Replaces the hardware acceptance filter configuration.
    ///
    /// If the hardware has fewer filters than requested, the set is
    /// coalesced. An empty set rejects all traffic. On failure the
    /// transport retries on a periodic tick.
    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError>;

    /// Schedules one frame for transmission and returns immediately.
    ///
    /// Returns `Ok(false)` when the media cannot take the frame right now;
    /// the caller keeps the frame and retries on the "ready to push"
    /// callback. If `deadline` has already passed the media may drop the
    /// frame and still report `Ok(true)`.
    fn push(&mut self, deadline: TimePoint, can_id: u32, payload: &[u8]) -> Result<bool, MediaError>;

    /// Takes the next received frame, writing its payload into `buffer`.
    /// Returns `Ok(None)` immediately when the reception queue is empty.
    fn pop(&mut self, buffer: &mut [u8]) -> Result<Option<CanFrameMeta>, MediaError>;

    /// Registers a "ready to push" function at the executor this media was
    /// built around. The returned handle must not outlive the executor.
    fn register_push_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError>;

    /// Registers a "ready to pop" function at the executor this media was
    /// built around. The returned handle must not outlive the executor.
    fn register_pop_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError>;
}

/// An IPv4 endpoint (address + UDP port) on the Cyphal/UDP network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UdpEndpoint {
    pub ip: [u8; 4],
    pub port: u16,
}

impl fmt::Display for UdpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port
        )
    }
}

/// Metadata of a datagram taken from an RX socket.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagramMeta {
    pub timestamp: TimePoint,
    pub source: UdpEndpoint,
    pub payload_size: usize,
}

/// A non-blocking transmit socket; datagrams carry their destination.
pub trait UdpTxSocket {
    /// Same contract as [`CanMedia::push`], for whole datagrams.
    fn send(
        &mut self,
        deadline: TimePoint,
        destination: UdpEndpoint,
        payload: &[u8],
    ) -> Result<bool, MediaError>;

    fn register_push_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError>;
}

/// A non-blocking receive socket bound to one multicast group.
pub trait UdpRxSocket {
    fn pop(&mut self, buffer: &mut [u8]) -> Result<Option<UdpDatagramMeta>, MediaError>;

    fn register_pop_callback(
        &mut self,
        function: Box<dyn FnMut(TimePoint)>,
    ) -> Result<Callback, MediaError>;
}

/// Hardware abstraction for one UDP network interface.
///
/// RX sockets are created per session: the socket joins the multicast
/// group of the given endpoint. The TX socket sends datagrams keyed by
/// destination endpoint.
pub trait UdpMedia {
    /// Current maximum datagram payload size.
    fn mtu(&self) -> usize;

    fn make_tx_socket(&mut self) -> Result<Box<dyn UdpTxSocket>, MediaError>;

    fn make_rx_socket(&mut self, endpoint: UdpEndpoint) -> Result<Box<dyn UdpRxSocket>, MediaError>;
}
