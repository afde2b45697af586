//! Packet and transmit-sink seams.
//!
//! The scheduler never looks inside a packet. It only needs its wire length
//! for rate limiting, and something to hand it to once admitted.

/// An opaque unit of transmission.
pub trait Packet: Send + 'static {
    /// Bytes the packet occupies on the link.
    fn wire_len(&self) -> usize;
}

impl Packet for Vec<u8> {
    #[inline]
    fn wire_len(&self) -> usize {
        self.len()
    }
}

impl Packet for Box<[u8]> {
    #[inline]
    fn wire_len(&self) -> usize {
        self.len()
    }
}

/// The external transmit path.
///
/// Called by the arbiter in immediate-send mode and by the dispatcher in
/// batch-dispatch mode, always from a single thread at a time.
pub trait TransmitSink<P>: Send + 'static {
    fn transmit(&mut self, packet: P);
}

impl<P, F> TransmitSink<P> for F
where
    F: FnMut(P) + Send + 'static,
{
    #[inline]
    fn transmit(&mut self, packet: P) {
        self(packet);
    }
}
