use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    chlo::{HandshakeExtractor, ParsedClientHello},
    config::DispatcherConfig,
    shared::ConnectionId,
};

/// A datagram received before its session existed
#[derive(Debug, Clone)]
pub(crate) struct BufferedPacket {
    pub(crate) data: Bytes,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
}

/// Packets and handshake progress of one connection without a session
pub(crate) struct BufferedPacketList {
    /// Packets in arrival order
    pub(crate) packets: Vec<BufferedPacket>,
    pub(crate) created: Instant,
    /// Set once the ClientHello is complete
    pub(crate) parsed_chlo: Option<ParsedClientHello>,
    /// Extractor still waiting for the rest of the ClientHello
    pub(crate) extractor: Option<Box<dyn HandshakeExtractor>>,
    pub(crate) version: u32,
    /// Source ID of the first packet
    pub(crate) client_cid: ConnectionId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EnqueueResult {
    Success,
    TooManyPackets,
    TooManyConnections,
}

/// Per-connection packet fields recorded when a list is created
pub(crate) struct NewList {
    pub(crate) version: u32,
    pub(crate) client_cid: ConnectionId,
    pub(crate) extractor: Option<Box<dyn HandshakeExtractor>>,
}

/// Holds datagrams of connections whose session does not exist yet
///
/// Uses a standard `HashMap` since connection IDs here are chosen by the peer.
pub(crate) struct BufferedPacketStore {
    lists: HashMap<ConnectionId, BufferedPacketList>,
    /// Connections with a complete ClientHello, in the order they completed
    chlo_order: VecDeque<ConnectionId>,
    /// Connections in creation order, for expiry
    expiry_order: VecDeque<(Instant, ConnectionId)>,
    config: Arc<DispatcherConfig>,
}

impl BufferedPacketStore {
    pub(crate) fn new(config: Arc<DispatcherConfig>) -> Self {
        Self {
            lists: HashMap::new(),
            chlo_order: VecDeque::new(),
            expiry_order: VecDeque::new(),
            config,
        }
    }

    /// Buffer `packet` for `cid`, creating its list from `new` if there is none
    ///
    /// Passing `chlo` marks the connection as ready for session creation. The packet that
    /// completes a ClientHello is always accepted, even when the list is full.
    pub(crate) fn enqueue(
        &mut self,
        cid: ConnectionId,
        packet: BufferedPacket,
        chlo: Option<ParsedClientHello>,
        new: NewList,
        now: Instant,
    ) -> EnqueueResult {
        let is_chlo = chlo.is_some();
        if !self.lists.contains_key(&cid) {
            if self.lists.len() >= self.config.max_buffered_connections {
                return EnqueueResult::TooManyConnections;
            }
            if !is_chlo && self.connections_without_chlo() >= self.config.max_connections_without_chlo
            {
                return EnqueueResult::TooManyConnections;
            }
            self.lists.insert(
                cid,
                BufferedPacketList {
                    packets: Vec::new(),
                    created: now,
                    parsed_chlo: None,
                    extractor: new.extractor,
                    version: new.version,
                    client_cid: new.client_cid,
                },
            );
            self.expiry_order.push_back((now, cid));
        }

        let Some(list) = self.lists.get_mut(&cid) else {
            return EnqueueResult::TooManyConnections;
        };
        if !is_chlo && list.packets.len() >= self.config.max_packets_per_connection {
            return EnqueueResult::TooManyPackets;
        }
        list.packets.push(packet);
        if let Some(chlo) = chlo {
            if list.parsed_chlo.is_none() {
                self.chlo_order.push_back(cid);
            }
            list.parsed_chlo = Some(chlo);
            list.extractor = None;
        }
        EnqueueResult::Success
    }

    pub(crate) fn has_buffered_packets(&self, cid: &ConnectionId) -> bool {
        self.lists.contains_key(cid)
    }

    /// Whether `cid` has a complete ClientHello waiting for a session
    pub(crate) fn has_chlo_for(&self, cid: &ConnectionId) -> bool {
        self.lists
            .get(cid)
            .map_or(false, |list| list.parsed_chlo.is_some())
    }

    pub(crate) fn has_chlos_buffered(&self) -> bool {
        !self.chlo_order.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub(crate) fn get_mut(&mut self, cid: &ConnectionId) -> Option<&mut BufferedPacketList> {
        self.lists.get_mut(cid)
    }

    /// Remove and return everything buffered for `cid`
    pub(crate) fn deliver_packets(&mut self, cid: &ConnectionId) -> Option<BufferedPacketList> {
        let list = self.lists.remove(cid)?;
        if list.parsed_chlo.is_some() {
            self.chlo_order.retain(|x| x != cid);
        }
        Some(list)
    }

    /// Remove and return the connection whose ClientHello completed first
    pub(crate) fn deliver_packets_for_next_connection(
        &mut self,
    ) -> Option<(ConnectionId, BufferedPacketList)> {
        while let Some(cid) = self.chlo_order.pop_front() {
            if let Some(list) = self.lists.remove(&cid) {
                return Some((cid, list));
            }
        }
        None
    }

    pub(crate) fn discard(&mut self, cid: &ConnectionId) {
        self.deliver_packets(cid);
    }

    pub(crate) fn discard_all(&mut self) {
        self.lists.clear();
        self.chlo_order.clear();
        self.expiry_order.clear();
    }

    /// Remove lists that outlived the buffered packet lifetime
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(ConnectionId, BufferedPacketList)> {
        let mut expired = Vec::new();
        while let Some(&(created, cid)) = self.expiry_order.front() {
            if created + self.config.buffered_packet_lifetime > now {
                break;
            }
            self.expiry_order.pop_front();
            // The list may have been delivered and recreated since
            if self.lists.get(&cid).map_or(false, |l| l.created == created) {
                if let Some(list) = self.deliver_packets(&cid) {
                    debug!(%cid, packets = list.packets.len(), "buffered packets expired");
                    expired.push((cid, list));
                }
            }
        }
        expired
    }

    /// When the oldest list expires
    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        // Drop bookkeeping for lists that are already gone
        while let Some(&(created, cid)) = self.expiry_order.front() {
            if self.lists.get(&cid).map_or(false, |l| l.created == created) {
                return Some(created + self.config.buffered_packet_lifetime);
            }
            self.expiry_order.pop_front();
        }
        None
    }

    fn connections_without_chlo(&self) -> usize {
        self.lists.len().saturating_sub(self.chlo_order.len())
    }
}
