use std::{
    collections::{hash_map, HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashSet;
use slab::Slab;
use thiserror::Error;
use tinyvec::TinyVec;
use tracing::{debug, error, trace, warn};

use crate::{
    buffered_packets::{BufferedPacket, BufferedPacketStore, EnqueueResult, NewList},
    chlo::{
        self, Extraction, ExtractorFactory, HandshakeExtractor, ParsedClientHello,
        TlsExtractorFactory,
    },
    cid_generator::ConnectionIdGenerator,
    config::DispatcherConfig,
    crypto::rustls::InitialKeys,
    packet::{self, PacketDecodeError, PublicHeader},
    session::{CloseSource, NewSession, PacketWriter, ServerSession, SessionEvent, SessionFactory},
    shared::ConnectionId,
    stats::DispatcherStats,
    time_wait::{TimeWaitAction, TimeWaitList},
    Side, TransportErrorCode, MIN_INITIAL_CID_LEN,
};

/// Routes every datagram received on a shared socket to the session it belongs to
///
/// Datagrams for unknown connections are buffered until the client's whole ClientHello has
/// been seen, at which point a session is created through the [`SessionFactory`]. Everything
/// that cannot belong to a session is answered statelessly, if at all.
///
/// The dispatcher never blocks and owns no timers: call [`poll_timeout`](Self::poll_timeout)
/// after each interaction and [`handle_timeout`](Self::handle_timeout) when the deadline passes.
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    sessions: Slab<SessionEntry>,
    /// Every connection ID routed to a live session
    ///
    /// Uses a standard `HashMap` to protect against hash collision attacks, since some of the
    /// IDs were chosen by clients.
    session_map: HashMap<ConnectionId, SessionHandle>,
    buffered: BufferedPacketStore,
    time_wait: TimeWaitList,
    write_blocked: WriteBlockedList,
    /// Closed sessions awaiting destruction
    closed_sessions: Vec<Box<dyn ServerSession>>,
    delete_sessions_at: Option<Instant>,
    /// Peers that received a stateless reset recently
    recent_resets: HashSet<SocketAddr>,
    clear_resets_at: Option<Instant>,
    cid_generator: Box<dyn ConnectionIdGenerator>,
    session_factory: Box<dyn SessionFactory>,
    extractor_factory: Box<dyn ExtractorFactory>,
    writer: Box<dyn PacketWriter>,
    accepting: bool,
    /// Sessions that may still be created in this event loop iteration
    new_sessions_allowed: usize,
    last_error: Option<ProcessError>,
    stats: DispatcherStats,
    rng: StdRng,
}

impl Dispatcher {
    /// Create a dispatcher extracting TLS ClientHellos with the configured Initial suite
    pub fn new(
        config: Arc<DispatcherConfig>,
        session_factory: Box<dyn SessionFactory>,
        writer: Box<dyn PacketWriter>,
    ) -> Self {
        let extractor_factory = Box::new(TlsExtractorFactory::with_optional_suite(
            config.initial_suite.clone(),
        ));
        Self::with_extractor(config, session_factory, extractor_factory, writer)
    }

    /// Create a dispatcher using a custom handshake extractor
    pub fn with_extractor(
        config: Arc<DispatcherConfig>,
        session_factory: Box<dyn SessionFactory>,
        extractor_factory: Box<dyn ExtractorFactory>,
        writer: Box<dyn PacketWriter>,
    ) -> Self {
        Self {
            cid_generator: (config.connection_id_generator_factory)(),
            sessions: Slab::new(),
            session_map: HashMap::new(),
            buffered: BufferedPacketStore::new(config.clone()),
            time_wait: TimeWaitList::new(config.clone()),
            write_blocked: WriteBlockedList::default(),
            closed_sessions: Vec::new(),
            delete_sessions_at: None,
            recent_resets: HashSet::new(),
            clear_resets_at: None,
            session_factory,
            extractor_factory,
            writer,
            accepting: true,
            new_sessions_allowed: 0,
            last_error: None,
            stats: DispatcherStats::default(),
            rng: StdRng::from_entropy(),
            config,
        }
    }

    /// Process an incoming UDP datagram
    pub fn process_packet(
        &mut self,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        data: Bytes,
    ) {
        self.stats.packets_processed += 1;
        let header = match PublicHeader::decode(
            &data,
            |first| self.cid_generator.expected_len(first),
            &self.config.supported_versions,
        ) {
            Ok(header) => header,
            Err(e) => {
                trace!("malformed header: {}", e);
                self.drop_packet(e.into());
                return;
            }
        };

        let mut packet = ReceivedPacket {
            local,
            peer,
            data,
            header,
        };
        let mut fate = self.classify(&packet);
        if let (PacketFate::Reset, Some(len)) = (&fate, self.config.fixed_short_header_cid_len) {
            // The generator may have misjudged the ID length; retry once with the fixed length
            if let Ok(header) = PublicHeader::decode(&packet.data, |_| len, &[]) {
                let retry = ReceivedPacket {
                    local,
                    peer,
                    data: packet.data.clone(),
                    header,
                };
                let retry_fate = self.classify(&retry);
                if matches!(retry_fate, PacketFate::Deliver(_) | PacketFate::TimeWait) {
                    trace!(cid = %retry.header.dst_cid, "routed with fixed short header CID length");
                    fate = retry_fate;
                    packet = retry;
                }
            }
        }
        self.dispatch(now, packet, fate);
    }

    /// Decide what to do with `packet` without side effects
    fn classify(&self, packet: &ReceivedPacket) -> PacketFate {
        let header = &packet.header;
        let cid = &header.dst_cid;
        if is_blocked_port(packet.peer.port()) {
            return PacketFate::Drop(ProcessError::BlockedPort);
        }
        if let Some(version) = header.version {
            if self.config.is_supported_version(version)
                && !self.config.allow_short_initial_cids
                && cid.len() < MIN_INITIAL_CID_LEN
                && cid.len() < self.cid_generator.expected_len(cid.first().copied().unwrap_or(0))
            {
                return PacketFate::Drop(ProcessError::InvalidConnectionIdLength);
            }
        }

        if let Some(&handle) = self.session_map.get(cid) {
            return PacketFate::Deliver(handle);
        }
        if self.buffered.has_chlo_for(cid) {
            return PacketFate::Buffer;
        }
        if self.session_factory.is_unroutable(cid) {
            return PacketFate::Drop(ProcessError::Unroutable);
        }
        if self.time_wait.is_in_time_wait(cid) {
            return PacketFate::TimeWait;
        }

        let Some(version) = header.version else {
            return PacketFate::Reset;
        };
        if header.is_version_negotiation() {
            return PacketFate::Drop(ProcessError::VersionNegotiationPacket);
        }
        if !self.accepting {
            return PacketFate::Reject;
        }
        if !self.config.is_supported_version(version) {
            if packet.data.len() < self.config.min_version_negotiation_size {
                return PacketFate::Drop(ProcessError::TooSmall);
            }
            return PacketFate::Negotiate;
        }
        if self.config.validate_chlo_size
            && header.is_initial()
            && packet.data.len() < self.config.min_initial_size
        {
            return PacketFate::Drop(ProcessError::TooSmall);
        }
        PacketFate::Extract
    }

    fn dispatch(&mut self, now: Instant, packet: ReceivedPacket, fate: PacketFate) {
        if matches!(
            fate,
            PacketFate::Reject | PacketFate::Negotiate | PacketFate::Extract | PacketFate::Reset
        ) {
            self.stats.packets_with_unknown_cid += 1;
        }
        match fate {
            PacketFate::Deliver(handle) => self.deliver(now, handle, packet.into_buffered()),
            PacketFate::Buffer => self.buffer_packet(now, packet, None, None),
            PacketFate::TimeWait => self.answer_from_time_wait(&packet),
            PacketFate::Negotiate => {
                let header = &packet.header;
                debug!(
                    version = ?header.version,
                    cid = %header.dst_cid,
                    "sending version negotiation"
                );
                let vn = self.time_wait.version_negotiation_packet(
                    &header.dst_cid,
                    &header.src_cid,
                    &self.config.supported_versions,
                );
                self.stats.version_negotiations_sent += 1;
                if header.dst_cid.is_empty() {
                    // An empty ID would route every such client to one entry
                    self.time_wait
                        .send_or_queue(vn, packet.local, packet.peer, &mut *self.writer);
                    self.register_time_wait_writes();
                } else {
                    self.time_wait.add(
                        &[header.dst_cid],
                        TimeWaitAction::SendTerminationPackets,
                        vec![vn],
                        now,
                    );
                    self.answer_from_time_wait(&packet);
                }
            }
            PacketFate::Reject => {
                let header = &packet.header;
                debug!(cid = %header.dst_cid, "rejecting new connection");
                self.stats.connections_rejected += 1;
                self.buffered.discard(&header.dst_cid);
                self.stateless_terminate(
                    now,
                    header.version,
                    header.dst_cid,
                    header.src_cid,
                    &[header.dst_cid],
                    TransportErrorCode::CONNECTION_REFUSED,
                    "Stop accepting new connections",
                    TimeWaitAction::SendTerminationPackets,
                );
                self.answer_from_time_wait(&packet);
                self.session_factory.on_new_connection_rejected();
            }
            PacketFate::Extract => self.extract(now, packet),
            PacketFate::Reset => self.maybe_reset(now, &packet),
            PacketFate::Drop(error) => {
                trace!(cid = %packet.header.dst_cid, "dropping packet: {}", error);
                self.drop_packet(error);
            }
        }
    }

    /// Feed a packet of a connection without a session to its handshake extractor
    fn extract(&mut self, now: Instant, packet: ReceivedPacket) {
        let cid = packet.header.dst_cid;
        let version = packet.header.version.unwrap_or_default();
        let mut new_extractor = None;
        let has_list = self.buffered.has_buffered_packets(&cid);
        let extraction = match self
            .buffered
            .get_mut(&cid)
            .and_then(|list| list.extractor.as_mut())
        {
            Some(extractor) => extractor.ingest(&packet.header, &packet.data),
            None if has_list => Extraction::Incomplete,
            None => {
                let mut extractor = self.extractor_factory.new_extractor(version, &cid);
                let extraction = extractor.ingest(&packet.header, &packet.data);
                new_extractor = Some(extractor);
                extraction
            }
        };
        let extraction = match extraction {
            Extraction::Incomplete if !self.config.buffer_chlos => {
                Extraction::Complete(ParsedClientHello::default())
            }
            x => x,
        };

        match extraction {
            Extraction::Incomplete => {
                trace!(%cid, "ClientHello incomplete");
                self.buffer_packet(now, packet, None, new_extractor);
            }
            Extraction::Fatal { alert } => {
                let reason = format!(
                    "TLS handshake failure from dispatcher (ENCRYPTION_INITIAL) {}: {}",
                    alert,
                    chlo::alert_name(alert)
                );
                debug!(%cid, "{}", reason);
                self.buffered.discard(&cid);
                self.stateless_terminate(
                    now,
                    packet.header.version,
                    cid,
                    packet.header.src_cid,
                    &[cid],
                    TransportErrorCode::crypto(alert),
                    &reason,
                    TimeWaitAction::SendTerminationPackets,
                );
                self.answer_from_time_wait(&packet);
            }
            Extraction::Complete(chlo) if self.new_sessions_allowed == 0 => {
                trace!(%cid, "session budget exhausted, buffering ClientHello");
                self.buffer_packet(now, packet, Some(chlo), new_extractor);
            }
            Extraction::Complete(chlo) => {
                let list = self.buffered.deliver_packets(&cid);
                let pending = PendingSession {
                    version,
                    client_cid: list
                        .as_ref()
                        .map_or(packet.header.src_cid, |list| list.client_cid),
                    local: packet.local,
                    peer: packet.peer,
                };
                // The packet completing the ClientHello goes first
                let mut packets = vec![packet.into_buffered()];
                if let Some(list) = list {
                    packets.extend(list.packets);
                }
                self.create_session(now, cid, pending, &chlo, packets);
            }
        }
    }

    /// Create sessions for buffered ClientHellos, oldest first
    ///
    /// At most `max_sessions` sessions are created, counting those created while processing
    /// packets until the next call.
    pub fn process_buffered_chlos(&mut self, now: Instant, max_sessions: usize) {
        self.new_sessions_allowed = max_sessions;
        while self.new_sessions_allowed > 0 {
            let Some((cid, list)) = self.buffered.deliver_packets_for_next_connection() else {
                break;
            };
            let (Some(chlo), Some(first)) = (list.parsed_chlo, list.packets.first()) else {
                continue;
            };
            let pending = PendingSession {
                version: list.version,
                client_cid: list.client_cid,
                local: first.local,
                peer: first.peer,
            };
            self.create_session(now, cid, pending, &chlo, list.packets);
        }
    }

    fn create_session(
        &mut self,
        now: Instant,
        original_cid: ConnectionId,
        pending: PendingSession,
        chlo: &ParsedClientHello,
        packets: Vec<BufferedPacket>,
    ) {
        self.new_sessions_allowed = self.new_sessions_allowed.saturating_sub(1);

        let server_cid = match self.cid_generator.maybe_replace(&original_cid, pending.version) {
            Some(replacement) if !replacement.is_empty() && replacement != original_cid => {
                replacement
            }
            _ => original_cid,
        };
        if server_cid != original_cid
            && (self.session_map.contains_key(&server_cid)
                || self.buffered.has_buffered_packets(&server_cid))
        {
            debug!(%original_cid, %server_cid, "replacement connection ID collides");
            self.stats.cid_collisions += 1;
            self.last_error = Some(ProcessError::CidCollision);
            if !self.session_map.contains_key(&original_cid) {
                self.stateless_terminate(
                    now,
                    Some(pending.version),
                    original_cid,
                    pending.client_cid,
                    &[original_cid],
                    TransportErrorCode::CONNECTION_REFUSED,
                    "Connection ID collision, please retry",
                    TimeWaitAction::SendTerminationPackets,
                );
            }
            return;
        }

        let alpn = select_alpn(&chlo.alpns, &self.config.alpn_protocols);
        let params = NewSession {
            server_cid,
            original_cid,
            client_cid: pending.client_cid,
            local: pending.local,
            peer: pending.peer,
            version: pending.version,
            alpn,
            chlo,
            cid_generator: &mut *self.cid_generator,
        };
        let Some(session) = self.session_factory.create_session(params) else {
            error!(bug = true, %original_cid, "session factory failed to create a session");
            self.last_error = Some(ProcessError::SessionCreationFailed);
            return;
        };

        let handle = SessionHandle(self.sessions.insert(SessionEntry {
            session,
            ids: TinyVec::new(),
        }));
        self.stats.sessions_created += 1;
        debug!(
            %server_cid,
            %original_cid,
            version = pending.version,
            sni = ?chlo.sni,
            "new session"
        );
        self.add_connection_id(handle, server_cid);
        if server_cid != original_cid {
            self.add_connection_id(handle, original_cid);
        }

        for packet in packets {
            if !self.sessions.contains(handle.0) {
                break;
            }
            self.deliver(now, handle, packet);
        }
    }

    fn deliver(&mut self, now: Instant, handle: SessionHandle, packet: BufferedPacket) {
        let Some(entry) = self.sessions.get_mut(handle.0) else {
            error!(bug = true, ?handle, "packet routed to a missing session");
            return;
        };
        entry.session.process_datagram(
            now,
            packet.local,
            packet.peer,
            packet.data,
            &mut *self.writer,
        );
        self.process_session_events(now, handle);
    }

    fn process_session_events(&mut self, now: Instant, handle: SessionHandle) {
        loop {
            let Some(entry) = self.sessions.get_mut(handle.0) else {
                return;
            };
            let Some(event) = entry.session.poll_event() else {
                return;
            };
            match event {
                SessionEvent::WriteBlocked => {
                    self.write_blocked.insert(BlockedWriter::Session(handle));
                }
                SessionEvent::NewConnectionId(cid) => {
                    if !self.try_add_new_connection_id(handle, cid) {
                        if let Some(entry) = self.sessions.get_mut(handle.0) {
                            entry.session.connection_id_rejected(cid);
                        }
                    }
                }
                SessionEvent::RetireConnectionId(cid) => self.retire_connection_id(handle, cid),
                SessionEvent::Closed {
                    code,
                    reason,
                    source,
                } => {
                    self.on_session_closed(now, handle, code, &reason, source);
                    return;
                }
            }
        }
    }

    /// Route `cid` to a session, unless another connection uses it already
    fn try_add_new_connection_id(&mut self, handle: SessionHandle, cid: ConnectionId) -> bool {
        let owned_elsewhere = self
            .session_map
            .get(&cid)
            .map_or(false, |&owner| owner != handle);
        if owned_elsewhere
            || self.time_wait.is_in_time_wait(&cid)
            || self.buffered.has_buffered_packets(&cid)
        {
            debug!(%cid, "new connection ID is in use");
            return false;
        }
        self.add_connection_id(handle, cid)
    }

    fn add_connection_id(&mut self, handle: SessionHandle, cid: ConnectionId) -> bool {
        match self.session_map.entry(cid) {
            hash_map::Entry::Occupied(e) => {
                if *e.get() != handle {
                    error!(
                        bug = true,
                        %cid,
                        existing = ?e.get(),
                        ?handle,
                        "connection ID routes to another session"
                    );
                    return false;
                }
                true
            }
            hash_map::Entry::Vacant(e) => {
                e.insert(handle);
                self.sessions[handle.0].ids.push(cid);
                true
            }
        }
    }

    fn retire_connection_id(&mut self, handle: SessionHandle, cid: ConnectionId) {
        if self.session_map.get(&cid) != Some(&handle) {
            debug!(%cid, "retiring connection ID not routed to the session");
            return;
        }
        self.session_map.remove(&cid);
        if let Some(entry) = self.sessions.get_mut(handle.0) {
            entry.ids.retain(|x| *x != cid);
        }
    }

    fn on_session_closed(
        &mut self,
        now: Instant,
        handle: SessionHandle,
        code: TransportErrorCode,
        reason: &str,
        source: CloseSource,
    ) {
        if !self.sessions.contains(handle.0) {
            return;
        }
        let SessionEntry { mut session, ids } = self.sessions.remove(handle.0);
        debug!(?handle, %code, reason, ?source, "session closed");
        self.write_blocked.remove(BlockedWriter::Session(handle));

        let mut removed = TinyVec::<[ConnectionId; 2]>::new();
        for cid in ids {
            match self.session_map.get(&cid) {
                Some(&owner) if owner == handle => {
                    self.session_map.remove(&cid);
                    removed.push(cid);
                }
                Some(&owner) => {
                    error!(bug = true, %cid, ?owner, ?handle, "alias routes to another session");
                }
                None => {}
            }
        }

        let packets = session.take_termination_packets();
        let (action, packets) = if !packets.is_empty() {
            (TimeWaitAction::SendTerminationPackets, packets)
        } else if !session.is_handshake_complete() && source == CloseSource::Local {
            let original_cid = session.original_destination_connection_id();
            let server_cid = removed.first().copied().unwrap_or(original_cid);
            let (packet, _) = self.termination_packet(
                session.version(),
                original_cid,
                session.peer_connection_id(),
                server_cid,
                TransportErrorCode::PROTOCOL_VIOLATION,
                "Connection is closed by server before handshake confirmed",
            );
            (TimeWaitAction::SendTerminationPackets, vec![packet])
        } else {
            (TimeWaitAction::SendStatelessReset, Vec::new())
        };
        if !removed.is_empty() {
            self.time_wait.add(&removed, action, packets, now);
        }

        // Destroyed later, outside of any callback into the session
        self.closed_sessions.push(session);
        self.delete_sessions_at.get_or_insert(now);
        self.stats.sessions_closed += 1;
    }

    /// Close a connection that has no session and put its IDs into time-wait
    #[allow(clippy::too_many_arguments)]
    fn stateless_terminate(
        &mut self,
        now: Instant,
        version: Option<u32>,
        original_cid: ConnectionId,
        client_cid: ConnectionId,
        ids: &[ConnectionId],
        code: TransportErrorCode,
        reason: &str,
        action: TimeWaitAction,
    ) {
        self.stats.stateless_closes += 1;
        let Some(version) = version else {
            self.time_wait.add(ids, action, Vec::new(), now);
            return;
        };
        let (packet, is_close) =
            self.termination_packet(version, original_cid, client_cid, original_cid, code, reason);
        if is_close {
            self.session_factory.on_stateless_close_generated(code);
        }
        self.time_wait.add(
            ids,
            TimeWaitAction::SendTerminationPackets,
            vec![packet],
            now,
        );
    }

    /// Build a packet telling the client its connection is gone
    ///
    /// This is an Initial packet carrying CONNECTION_CLOSE when Initial keys exist for
    /// `version`, and a version negotiation packet listing no versions otherwise. The flag is
    /// set for the former.
    fn termination_packet(
        &mut self,
        version: u32,
        original_cid: ConnectionId,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        code: TransportErrorCode,
        reason: &str,
    ) -> (Bytes, bool) {
        let mut buf = Vec::new();
        let keys = self
            .config
            .initial_suite
            .as_ref()
            .filter(|_| self.config.is_supported_version(version))
            .and_then(|suite| InitialKeys::new(suite, version, &original_cid, Side::Server).ok());
        if let Some(keys) = keys {
            match packet::encode_initial_close(
                &mut buf, &keys, version, &dst_cid, &src_cid, code, reason,
            ) {
                Ok(()) => return (buf.into(), true),
                Err(_) => {
                    error!(bug = true, "failed to protect connection close");
                    buf.clear();
                }
            }
        }
        packet::encode_version_negotiation(
            &mut buf,
            self.rng.gen::<u8>() | packet::FIXED_BIT,
            &dst_cid,
            &src_cid,
            &[],
        );
        (buf.into(), false)
    }

    fn answer_from_time_wait(&mut self, packet: &ReceivedPacket) {
        let sent = self.time_wait.process_packet(
            packet.local,
            packet.peer,
            &packet.header.dst_cid,
            packet.header.form,
            packet.data.len(),
            &mut *self.writer,
        );
        self.stats.time_wait_responses += sent as u64;
        self.register_time_wait_writes();
    }

    /// Answer an unversioned packet for an unknown connection with a stateless reset
    fn maybe_reset(&mut self, now: Instant, packet: &ReceivedPacket) {
        let len = packet.data.len();
        if self.recent_resets.contains(&packet.peer) {
            trace!(peer = %packet.peer, "peer received a stateless reset recently");
            self.drop_packet(ProcessError::StatelessResetLimited);
            return;
        }
        // Flags, CID, then at least a packet number byte, a frame and an AEAD tag
        let min_len = 1 + packet.header.dst_cid.len() + 1 + 1 + 12;
        if len <= self.config.min_stateless_reset_size || len < min_len {
            trace!(len, "packet too small for a stateless reset");
            self.drop_packet(ProcessError::TooSmall);
            return;
        }
        if self.recent_resets.len() >= self.config.max_recent_reset_addresses {
            warn!("too many recent stateless resets, dropping packet");
            self.drop_packet(ProcessError::StatelessResetLimited);
            return;
        }
        if !self.time_wait.send_stateless_reset(
            packet.local,
            packet.peer,
            &packet.header.dst_cid,
            len,
            &mut *self.writer,
        ) {
            self.drop_packet(ProcessError::TooSmall);
            return;
        }
        debug!(cid = %packet.header.dst_cid, peer = %packet.peer, "sent stateless reset");
        self.stats.stateless_resets_sent += 1;
        if self.recent_resets.is_empty() {
            self.clear_resets_at = Some(now + self.config.recent_reset_address_lifetime);
        }
        self.recent_resets.insert(packet.peer);
        self.register_time_wait_writes();
    }

    fn buffer_packet(
        &mut self,
        now: Instant,
        packet: ReceivedPacket,
        chlo: Option<ParsedClientHello>,
        extractor: Option<Box<dyn HandshakeExtractor>>,
    ) {
        let cid = packet.header.dst_cid;
        let new = NewList {
            version: packet.header.version.unwrap_or_default(),
            client_cid: packet.header.src_cid,
            extractor,
        };
        match self
            .buffered
            .enqueue(cid, packet.into_buffered(), chlo, new, now)
        {
            EnqueueResult::Success => self.stats.packets_buffered += 1,
            EnqueueResult::TooManyPackets => {
                debug!(%cid, "too many packets buffered for connection");
                self.drop_packet(ProcessError::BufferFull);
            }
            EnqueueResult::TooManyConnections => {
                debug!(%cid, "too many connections with buffered packets");
                self.drop_packet(ProcessError::BufferFull);
            }
        }
    }

    fn drop_packet(&mut self, error: ProcessError) {
        self.stats.packets_dropped += 1;
        self.last_error = Some(error);
    }

    fn register_time_wait_writes(&mut self) {
        if self.time_wait.has_pending_packets() {
            self.write_blocked.insert(BlockedWriter::TimeWait);
        }
    }

    /// The socket became writable again
    ///
    /// Every writer blocked so far gets one chance to write, in the order it blocked. Writers
    /// that block again wait for the next call.
    pub fn on_can_write(&mut self, now: Instant) {
        self.writer.set_writable();
        for blocked in self.write_blocked.take() {
            match blocked {
                BlockedWriter::TimeWait => {
                    self.time_wait.on_can_write(&mut *self.writer);
                    self.register_time_wait_writes();
                }
                BlockedWriter::Session(handle) => {
                    let Some(entry) = self.sessions.get_mut(handle.0) else {
                        continue;
                    };
                    entry.session.on_can_write(&mut *self.writer);
                    self.process_session_events(now, handle);
                }
            }
        }
    }

    /// Whether any writer is waiting for [`on_can_write`](Self::on_can_write)
    pub fn has_pending_writes(&self) -> bool {
        !self.write_blocked.is_empty()
    }

    /// Close every session and destroy them
    pub fn shutdown(&mut self, now: Instant) {
        const REASON: &str = "Server shutdown imminent";
        let handles = self
            .sessions
            .iter()
            .map(|(key, _)| SessionHandle(key))
            .collect::<Vec<_>>();
        for handle in handles {
            if let Some(entry) = self.sessions.get_mut(handle.0) {
                entry.session.close(TransportErrorCode::NO_ERROR, REASON);
            }
            self.process_session_events(now, handle);
            if self.sessions.contains(handle.0) {
                warn!(?handle, "session did not report closure on shutdown");
                self.on_session_closed(
                    now,
                    handle,
                    TransportErrorCode::NO_ERROR,
                    REASON,
                    CloseSource::Local,
                );
            }
        }
        self.closed_sessions.clear();
        self.delete_sessions_at = None;
    }

    /// Resume creating sessions for new connections
    pub fn start_accepting_new_connections(&mut self) {
        self.accepting = true;
    }

    /// Reject new connections and drop every buffered packet
    pub fn stop_accepting_new_connections(&mut self) {
        self.accepting = false;
        self.buffered.discard_all();
    }

    /// Whether new connections are accepted
    pub fn is_accepting_new_connections(&self) -> bool {
        self.accepting
    }

    /// Fire every timer that expired at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.delete_sessions_at.map_or(false, |t| t <= now) {
            trace!(count = self.closed_sessions.len(), "deleting closed sessions");
            self.closed_sessions.clear();
            self.delete_sessions_at = None;
        }
        if self.clear_resets_at.map_or(false, |t| t <= now) {
            self.recent_resets.clear();
            self.clear_resets_at = None;
        }
        for (cid, list) in self.buffered.expire(now) {
            self.stateless_terminate(
                now,
                Some(list.version),
                cid,
                list.client_cid,
                &[cid],
                TransportErrorCode::PROTOCOL_VIOLATION,
                "Packets buffered for too long",
                TimeWaitAction::SendTerminationPackets,
            );
        }
        self.time_wait.handle_timeout(now);
    }

    /// The earliest time [`handle_timeout`](Self::handle_timeout) must be called at
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        [
            self.delete_sessions_at,
            self.clear_resets_at,
            self.buffered.poll_timeout(),
            self.time_wait.poll_timeout(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Every live session, each visited once
    pub fn sessions(&self) -> impl Iterator<Item = (SessionHandle, &dyn ServerSession)> {
        self.sessions
            .iter()
            .map(|(key, entry)| (SessionHandle(key), &*entry.session))
    }

    /// Connection IDs routed to a session
    pub fn connection_ids(&self, handle: SessionHandle) -> &[ConnectionId] {
        self.sessions
            .get(handle.0)
            .map_or(&[][..], |entry| &entry.ids[..])
    }

    /// Number of live sessions
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Number of closed connections whose IDs are in time-wait
    pub fn num_time_wait_connections(&self) -> usize {
        self.time_wait.num_connections()
    }

    /// Whether any complete ClientHello waits for a session
    pub fn has_chlos_buffered(&self) -> bool {
        self.buffered.has_chlos_buffered()
    }

    /// Whether packets of `cid` are buffered
    pub fn has_buffered_packets(&self, cid: &ConnectionId) -> bool {
        self.buffered.has_buffered_packets(cid)
    }

    /// Whether `cid` is in time-wait
    pub fn is_in_time_wait(&self, cid: &ConnectionId) -> bool {
        self.time_wait.is_in_time_wait(cid)
    }

    /// Why the last dropped packet was dropped
    pub fn last_error(&self) -> Option<&ProcessError> {
        self.last_error.as_ref()
    }

    /// Dispatcher statistics
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// The dispatcher's configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

/// Internal identifier for a session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionHandle(pub usize);

/// Why a datagram was dropped
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ProcessError {
    /// The public header could not be decoded
    #[error(transparent)]
    Decode(#[from] PacketDecodeError),
    /// The source port is used by amplification-prone services
    #[error("source port is blocked")]
    BlockedPort,
    /// The destination connection ID is too short for a new connection
    #[error("invalid destination connection ID length")]
    InvalidConnectionIdLength,
    /// The session factory reported the connection ID unroutable
    #[error("unroutable connection ID")]
    Unroutable,
    /// Version negotiation packets are never answered
    #[error("unexpected version negotiation packet")]
    VersionNegotiationPacket,
    /// The datagram is too small to be answered
    #[error("packet too small")]
    TooSmall,
    /// A stateless reset was withheld because the peer or the server sent too many recently
    #[error("stateless reset rate limited")]
    StatelessResetLimited,
    /// The session factory did not create a session
    #[error("session creation failed")]
    SessionCreationFailed,
    /// The replacement connection ID is in use
    #[error("connection ID collision")]
    CidCollision,
    /// No room to buffer the datagram
    #[error("packet buffer full")]
    BufferFull,
}

struct SessionEntry {
    session: Box<dyn ServerSession>,
    /// Connection IDs routed to the session
    ids: TinyVec<[ConnectionId; 2]>,
}

struct ReceivedPacket {
    local: SocketAddr,
    peer: SocketAddr,
    data: Bytes,
    header: PublicHeader,
}

impl ReceivedPacket {
    fn into_buffered(self) -> BufferedPacket {
        BufferedPacket {
            data: self.data,
            local: self.local,
            peer: self.peer,
        }
    }
}

/// Parameters of a session about to be created
struct PendingSession {
    version: u32,
    client_cid: ConnectionId,
    local: SocketAddr,
    peer: SocketAddr,
}

/// What to do with a received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
enum PacketFate {
    /// Hand it to a live session
    Deliver(SessionHandle),
    /// Its ClientHello waits for the session budget; buffer it alongside
    Buffer,
    /// Answer it from the time-wait list
    TimeWait,
    /// Answer it with version negotiation
    Negotiate,
    /// Refuse the new connection
    Reject,
    /// Feed it to the handshake extractor
    Extract,
    /// Unversioned and unknown; maybe answer with a stateless reset
    Reset,
    /// Drop it silently
    Drop(ProcessError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum BlockedWriter {
    TimeWait,
    Session(SessionHandle),
}

/// Writers waiting for the socket, in the order they blocked
#[derive(Default)]
struct WriteBlockedList {
    order: VecDeque<BlockedWriter>,
    members: FxHashSet<BlockedWriter>,
}

impl WriteBlockedList {
    fn insert(&mut self, writer: BlockedWriter) {
        if self.members.insert(writer) {
            self.order.push_back(writer);
        }
    }

    fn remove(&mut self, writer: BlockedWriter) {
        if self.members.remove(&writer) {
            self.order.retain(|x| *x != writer);
        }
    }

    /// Empty the list, returning its former contents
    fn take(&mut self) -> VecDeque<BlockedWriter> {
        self.members.clear();
        std::mem::take(&mut self.order)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Application protocol for a new connection
///
/// The first protocol the client offers that the server supports, else the client's first.
fn select_alpn(offered: &[Vec<u8>], supported: &[Vec<u8>]) -> Option<Vec<u8>> {
    offered
        .iter()
        .find(|alpn| supported.contains(alpn))
        .or_else(|| offered.first())
        .cloned()
}

/// Source ports of services commonly abused for reflection attacks
const BLOCKED_PORTS: [u16; 16] = [
    0, 17, 19, 53, 111, 123, 137, 138, 161, 389, 500, 1900, 3702, 5353, 5355, 11211,
];

fn is_blocked_port(port: u16) -> bool {
    if port > BLOCKED_PORTS[BLOCKED_PORTS.len() - 1] {
        return false;
    }
    BLOCKED_PORTS.binary_search(&port).is_ok()
}
