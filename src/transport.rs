use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// The seam between the BSP engine and whatever actually carries PUPs (raw Ethernet, UDP
///  encapsulation, a serial link). The engine only ever hands over fully encoded packet
///  buffers; delivery is unreliable and unordered, and the engine does not assume otherwise.
///
/// Inbound traffic takes the opposite path: the adapter feeds received buffers into
///  `BspManager::on_raw_packet`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet_buf: &[u8]);
}

/// UDP encapsulation: each PUP travels as the payload of one UDP datagram to a fixed peer
///  address. Send errors are logged and swallowed - to the protocol they are
///  indistinguishable from packet loss, and loss recovery handles them.
pub struct UdpPacketSink {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
}

impl UdpPacketSink {
    pub fn new(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> UdpPacketSink {
        UdpPacketSink { socket, peer_addr }
    }
}

#[async_trait]
impl PacketSink for UdpPacketSink {
    async fn send_packet(&self, packet_buf: &[u8]) {
        trace!("sending {} byte packet to {:?}", packet_buf.len(), self.peer_addr);

        if let Err(e) = self.socket.send_to(packet_buf, self.peer_addr).await {
            error!("error sending UDP packet to {:?}: {}", self.peer_addr, e);
        }
    }
}
