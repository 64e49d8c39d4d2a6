use std::{io, net::SocketAddr, sync::Arc};

use proto::{PacketWriter, WriteStatus};
use tracing::{trace, warn};

use crate::runtime::AsyncUdpSocket;

/// Writes the dispatcher's datagrams straight to a UDP socket
///
/// Once the socket refuses a datagram the writer stays blocked, refusing everything, until the
/// driver sees the socket become writable again.
#[derive(Debug)]
pub struct UdpPacketWriter {
    socket: Arc<dyn AsyncUdpSocket>,
    blocked: bool,
}

impl UdpPacketWriter {
    /// Create a writer sending through `socket`
    pub fn new(socket: Arc<dyn AsyncUdpSocket>) -> Self {
        Self {
            socket,
            blocked: false,
        }
    }
}

impl PacketWriter for UdpPacketWriter {
    fn is_write_blocked(&self) -> bool {
        self.blocked
    }

    fn set_writable(&mut self) {
        self.blocked = false;
    }

    fn write_packet(&mut self, packet: &[u8], _local: SocketAddr, peer: SocketAddr) -> WriteStatus {
        if self.blocked {
            return WriteStatus::Blocked;
        }
        match self.socket.try_send(packet, peer) {
            Ok(len) => WriteStatus::Ok(len),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%peer, "socket send buffer full");
                self.blocked = true;
                WriteStatus::Blocked
            }
            Err(e) => {
                warn!(%peer, "failed to send datagram: {}", e);
                WriteStatus::Error(e)
            }
        }
    }
}
