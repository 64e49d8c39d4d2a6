use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use slab::Slab;
use tinyvec::TinyVec;
use tracing::{debug, trace};

use crate::{
    config::DispatcherConfig,
    packet::{self, HeaderForm},
    session::{PacketWriter, WriteStatus},
    shared::ConnectionId,
    token::ResetToken,
};

/// What to answer packets for a connection in time-wait with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeWaitAction {
    /// Drop packets silently
    DoNothing,
    /// Answer short header packets with a stateless reset
    SendStatelessReset,
    /// Replay the packets the connection was terminated with
    SendTerminationPackets,
}

struct Entry {
    /// Every ID that routes to the terminated connection
    ids: TinyVec<[ConnectionId; 2]>,
    action: TimeWaitAction,
    packets: Vec<Bytes>,
    /// Packets received since the connection entered time-wait
    received: u64,
    added: Instant,
    seq: u64,
}

struct QueuedPacket {
    data: Bytes,
    local: SocketAddr,
    peer: SocketAddr,
}

/// Remembers terminated connection IDs and answers their straggling packets statelessly
///
/// Uses a standard `HashMap` since connection IDs here are chosen by the peer.
pub(crate) struct TimeWaitList {
    entries: Slab<Entry>,
    index: HashMap<ConnectionId, usize>,
    /// Entries in insertion order, for expiry
    order: VecDeque<(u64, usize)>,
    next_seq: u64,
    /// Responses that could not be written because the socket was blocked
    pending: VecDeque<QueuedPacket>,
    config: Arc<DispatcherConfig>,
    rng: StdRng,
}

impl TimeWaitList {
    pub(crate) fn new(config: Arc<DispatcherConfig>) -> Self {
        Self {
            entries: Slab::new(),
            index: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            pending: VecDeque::new(),
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Put `ids` of one terminated connection into time-wait
    ///
    /// Any entry already holding one of the IDs is replaced.
    pub(crate) fn add(
        &mut self,
        ids: &[ConnectionId],
        action: TimeWaitAction,
        packets: Vec<Bytes>,
        now: Instant,
    ) {
        debug_assert!(!ids.is_empty());
        if action == TimeWaitAction::SendTerminationPackets && packets.is_empty() {
            tracing::error!(bug = true, "no termination packets for time-wait");
        }
        for id in ids {
            if let Some(&key) = self.index.get(id) {
                self.remove_entry(key);
            }
        }
        while self.entries.len() >= self.config.max_time_wait_connections.max(1) {
            if !self.remove_oldest() {
                break;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.entries.insert(Entry {
            ids: ids.iter().copied().collect(),
            action,
            packets,
            received: 0,
            added: now,
            seq,
        });
        for &id in ids {
            self.index.insert(id, key);
        }
        self.order.push_back((seq, key));
        debug!(cids = ?ids, ?action, "connection added to time-wait");
    }

    pub(crate) fn is_in_time_wait(&self, cid: &ConnectionId) -> bool {
        self.index.contains_key(cid)
    }

    pub(crate) fn num_connections(&self) -> usize {
        self.entries.len()
    }

    /// Answer a packet for a connection in time-wait
    ///
    /// Responses are throttled exponentially: only the 1st, 2nd, 4th, 8th, ... packet for a
    /// connection is answered. Returns the number of datagrams sent or queued.
    pub(crate) fn process_packet(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        cid: &ConnectionId,
        form: HeaderForm,
        packet_len: usize,
        writer: &mut dyn PacketWriter,
    ) -> usize {
        let Some(&key) = self.index.get(cid) else {
            debug!(%cid, "packet for connection not in time-wait");
            return 0;
        };
        let entry = &mut self.entries[key];
        entry.received += 1;
        if !entry.received.is_power_of_two() {
            trace!(%cid, received = entry.received, "throttling time-wait response");
            return 0;
        }

        match entry.action {
            TimeWaitAction::DoNothing => 0,
            TimeWaitAction::SendTerminationPackets => {
                let packets = entry.packets.clone();
                for data in &packets {
                    self.send_or_queue(data.clone(), local, peer, writer);
                }
                packets.len()
            }
            TimeWaitAction::SendStatelessReset => match form {
                // Long header packets cannot be answered with a stateless reset
                HeaderForm::Long => 0,
                HeaderForm::Short => {
                    usize::from(self.send_stateless_reset(local, peer, cid, packet_len, writer))
                }
            },
        }
    }

    /// Build the answer to a packet from `src_cid` to `dst_cid` listing the versions we support
    ///
    /// The first byte is random, so the packet is built once and replayed from time-wait.
    pub(crate) fn version_negotiation_packet(
        &mut self,
        dst_cid: &ConnectionId,
        src_cid: &ConnectionId,
        versions: &[u32],
    ) -> Bytes {
        let mut buf = Vec::new();
        let mut versions = versions.to_vec();
        // Grease with a reserved version
        versions.push(0x0a1a_2a3a);
        packet::encode_version_negotiation(
            &mut buf,
            self.rng.gen::<u8>() | packet::FIXED_BIT,
            src_cid,
            dst_cid,
            &versions,
        );
        buf.into()
    }

    /// Answer a short header packet for `cid` with a stateless reset
    ///
    /// Returns `false` if the inciting packet was too small to answer.
    pub(crate) fn send_stateless_reset(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        cid: &ConnectionId,
        inciting_len: usize,
        writer: &mut dyn PacketWriter,
    ) -> bool {
        let token = ResetToken::new(&*self.config.reset_key, cid);
        let mut buf = Vec::new();
        if !packet::encode_stateless_reset(&mut buf, &mut self.rng, inciting_len, &token) {
            debug!(
                "ignoring unexpected {} byte packet: not larger than minimum stateless reset size",
                inciting_len
            );
            return false;
        }
        self.send_or_queue(buf.into(), local, peer, writer);
        true
    }

    /// Write queued responses until the socket blocks again
    pub(crate) fn on_can_write(&mut self, writer: &mut dyn PacketWriter) {
        while let Some(packet) = self.pending.pop_front() {
            if writer.is_write_blocked() {
                self.pending.push_front(packet);
                return;
            }
            match writer.write_packet(&packet.data, packet.local, packet.peer) {
                WriteStatus::Ok(_) => {}
                WriteStatus::Blocked => {
                    self.pending.push_front(packet);
                    return;
                }
                WriteStatus::Error(e) => debug!("failed to send time-wait response: {}", e),
            }
        }
    }

    pub(crate) fn has_pending_packets(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget connections that have been in time-wait for the whole period
    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        while let Some(&(seq, key)) = self.order.front() {
            match self.entries.get(key) {
                Some(entry) if entry.seq == seq => {
                    if entry.added + self.config.time_wait_period > now {
                        break;
                    }
                    self.remove_entry(key);
                }
                _ => {
                    self.order.pop_front();
                }
            }
        }
    }

    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        while let Some(&(seq, key)) = self.order.front() {
            match self.entries.get(key) {
                Some(entry) if entry.seq == seq => {
                    return Some(entry.added + self.config.time_wait_period)
                }
                _ => {
                    self.order.pop_front();
                }
            }
        }
        None
    }

    /// Send `data` right away, unless the socket is blocked or earlier responses are queued
    pub(crate) fn send_or_queue(
        &mut self,
        data: Bytes,
        local: SocketAddr,
        peer: SocketAddr,
        writer: &mut dyn PacketWriter,
    ) {
        if !writer.is_write_blocked() && self.pending.is_empty() {
            match writer.write_packet(&data, local, peer) {
                WriteStatus::Ok(_) => return,
                WriteStatus::Blocked => {}
                WriteStatus::Error(e) => {
                    debug!("failed to send time-wait response: {}", e);
                    return;
                }
            }
        }
        if self.pending.len() >= self.config.max_time_wait_pending_packets {
            trace!("time-wait pending queue full, dropping response");
            return;
        }
        self.pending.push_back(QueuedPacket { data, local, peer });
    }

    fn remove_oldest(&mut self) -> bool {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.entries.get(key).map_or(false, |e| e.seq == seq) {
                self.remove_entry(key);
                return true;
            }
        }
        false
    }

    fn remove_entry(&mut self, key: usize) {
        let entry = self.entries.remove(key);
        for id in &entry.ids {
            if self.index.get(id) == Some(&key) {
                self.index.remove(id);
            }
        }
        if self.order.front().map_or(false, |&(seq, _)| seq == entry.seq) {
            self.order.pop_front();
        }
    }
}
