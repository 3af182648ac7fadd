//! Delivery guarantees and the per-guarantee engines.

pub mod fragmented;
pub mod ordered;
pub mod reliable;

use std::io;

/// Guarantee requested by the application for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryGuarantee {
    /// Fire and forget; may be lost, duplicated or reordered.
    Unreliable,
    /// Delivered exactly once, in arrival order.
    ReliableUnordered,
    /// Delivered exactly once, in send order.
    ReliableOrdered,
}

impl DeliveryGuarantee {
    pub fn is_reliable(self) -> bool {
        !matches!(self, DeliveryGuarantee::Unreliable)
    }
}

/// Outbound half of the underlying datagram socket.
///
/// Implementations hand one fully encoded datagram to the network. They must
/// not block and must not call back into the connection.
pub trait DatagramSink: Send + Sync {
    fn write_bytes(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Connected UDP socket. The peer address is fixed by `connect`.
impl DatagramSink for tokio::net::UdpSocket {
    fn write_bytes(&self, datagram: &[u8]) -> io::Result<()> {
        self.try_send(datagram).map(|_| ())
    }
}

/// Connected blocking UDP socket.
impl DatagramSink for std::net::UdpSocket {
    fn write_bytes(&self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram).map(|_| ())
    }
}
