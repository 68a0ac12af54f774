use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::{Error, Result};

use super::{DatagramRead, DatagramTransport};

/// UDP datagram transport over a tokio socket
///
/// All reads and writes are non-blocking (`try_recv_from`/`try_send_to`);
/// readiness waits go through the socket's readable notification. ICMP
/// unreachable errors surfaced on the socket are benign for media transport
/// and are treated as an empty read.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a new UDP transport to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::Transport)?;
        debug!("Bound UDP transport to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Wrap an already-configured socket (e.g. one joined to a multicast
    /// group by the caller)
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn wait_readable(&self) -> std::io::Result<()> {
        self.socket.readable().await
    }

    fn read_datagram(&self, buf: &mut [u8]) -> Result<DatagramRead> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => Ok(DatagramRead::Datagram { len, from }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(DatagramRead::WouldBlock),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                // ICMP port unreachable from a previous send; not fatal
                Ok(DatagramRead::WouldBlock)
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    fn write_datagram(&self, dest: SocketAddr, payload: &[u8]) -> Result<()> {
        match self.socket.try_send_to(payload, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Unreliable transport: a full send buffer drops the packet
                warn!("UDP send buffer full, dropping {} byte datagram", payload.len());
                Ok(())
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_roundtrip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.write_datagram(b_addr, b"hello").unwrap();

        b.wait_readable().await.unwrap();
        let mut buf = [0u8; 64];
        match b.read_datagram(&mut buf).unwrap() {
            DatagramRead::Datagram { len, from } => {
                assert_eq!(&buf[..len], b"hello");
                assert_eq!(from, a.local_addr().unwrap());
            }
            other => panic!("Expected datagram, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_read_would_block() {
        let t = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(t.read_datagram(&mut buf).unwrap(), DatagramRead::WouldBlock);
    }
}
