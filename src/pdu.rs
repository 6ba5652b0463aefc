//! L2CAP PDU wrapper over a pooled packet.

/// A protocol data unit: a packet buffer plus the number of valid octets.
pub struct Pdu<P> {
    packet: P,
    len: usize,
}

impl<P> Pdu<P> {
    /// Wrap `packet` with `len` valid octets.
    pub fn new(packet: P, len: usize) -> Self {
        Self { packet, len }
    }

    /// Number of valid octets.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the PDU carries no octets.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Recover the underlying packet.
    pub fn into_inner(self) -> P {
        self.packet
    }
}

impl<P: AsRef<[u8]>> AsRef<[u8]> for Pdu<P> {
    fn as_ref(&self) -> &[u8] {
        &self.packet.as_ref()[..self.len]
    }
}

impl<P: AsMut<[u8]>> AsMut<[u8]> for Pdu<P> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.packet.as_mut()[..self.len]
    }
}
