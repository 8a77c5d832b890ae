//! In-process transport

use tokio::io::DuplexStream;

use super::FramedTransport;

/// Framed transport over an in-memory duplex pipe
pub type MemoryTransport = FramedTransport<DuplexStream>;

const MEMORY_BUFFER: usize = 64 * 1024;

/// Two connected in-memory transports
///
/// Dropping or closing one end makes the other's `recv` return `None`.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(MEMORY_BUFFER);
    (FramedTransport::new(a), FramedTransport::new(b))
}
