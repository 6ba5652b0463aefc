//! Packet allocation seam.
//!
//! The security manager does not own packet memory; the host provides a pool
//! implementation and the engine allocates one packet per outgoing PDU.

/// A packet buffer handed out by a [`PacketPool`]. Dropping the packet
/// returns the buffer to the pool.
pub trait Packet: AsRef<[u8]> + AsMut<[u8]> {}

/// Allocator for packet buffers.
pub trait PacketPool {
    /// Packet type handed out by this pool.
    type Packet: Packet;
    /// Usable size of a single packet.
    const MTU: usize;

    /// Allocate a packet, or `None` if the pool is exhausted.
    fn allocate() -> Option<Self::Packet>;

    /// Total number of packets this pool can hold.
    fn capacity() -> usize;
}
