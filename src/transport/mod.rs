//! Datagram transport boundary
//!
//! The engine never calls OS socket APIs directly; every socket the
//! scheduler watches and every packet the pipelines read or write goes
//! through [`DatagramTransport`]. Socket creation, multicast group
//! management and TTL policy belong to the layer that constructs the
//! transport.

pub mod udp;

pub use udp::UdpTransport;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::Result;

/// Outcome of a non-blocking datagram read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramRead {
    /// A datagram of `len` bytes was read from `from`
    Datagram {
        /// Bytes written into the caller's buffer
        len: usize,
        /// Sender address
        from: SocketAddr,
    },

    /// No datagram available right now; retry on the next readiness event
    WouldBlock,

    /// The transport is closed and will never produce data again
    Closed,
}

/// Boundary contract between the engine and its socket layer
///
/// `wait_readable` is the only suspension point; `read_datagram` and
/// `write_datagram` must never block. A would-block write drops the
/// datagram (RTP makes no delivery guarantee), a would-block read simply
/// returns [`DatagramRead::WouldBlock`].
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Resolve when the transport may have a datagram to read
    async fn wait_readable(&self) -> std::io::Result<()>;

    /// Read one datagram into `buf` without blocking
    fn read_datagram(&self, buf: &mut [u8]) -> Result<DatagramRead>;

    /// Send one datagram to `dest` without blocking
    fn write_datagram(&self, dest: SocketAddr, payload: &[u8]) -> Result<()>;

    /// Local address, when the transport has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
