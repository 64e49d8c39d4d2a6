use std::{
    collections::VecDeque,
    io::{self, Cursor, Write},
    net::SocketAddr,
    str,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes};
use tracing::info;

use crate::{
    coding::{BufExt, Codec},
    crypto::rustls::{default_initial_suite, InitialKeys},
    ConnectionId, ConnectionIdGenerator, Dispatcher, DispatcherConfig, Extraction,
    ExtractorFactory, HandshakeExtractor, NewSession, PacketWriter, ParsedClientHello,
    PublicHeader, ServerSession, SessionEvent, SessionFactory, Side, TransportErrorCode,
    WriteStatus, DEFAULT_SUPPORTED_VERSIONS,
};

pub(crate) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// A datagram handed to a [`RecordingWriter`]
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub(crate) data: Bytes,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
}

/// Packet writer that records everything written and can simulate a full socket
#[derive(Debug, Default)]
pub(crate) struct RecordingWriter {
    pub(crate) sent: Vec<SentPacket>,
    blocked: bool,
}

impl RecordingWriter {
    /// Refuse writes until `set_writable` is called
    pub(crate) fn block(&mut self) {
        self.blocked = true;
    }
}

impl PacketWriter for RecordingWriter {
    fn is_write_blocked(&self) -> bool {
        self.blocked
    }

    fn set_writable(&mut self) {
        self.blocked = false;
    }

    fn write_packet(&mut self, packet: &[u8], local: SocketAddr, peer: SocketAddr) -> WriteStatus {
        if self.blocked {
            return WriteStatus::Blocked;
        }
        self.sent.push(SentPacket {
            data: Bytes::copy_from_slice(packet),
            local,
            peer,
        });
        WriteStatus::Ok(packet.len())
    }
}

/// A [`RecordingWriter`] the test keeps access to after handing it to the dispatcher
#[derive(Clone, Default)]
pub(super) struct SharedWriter(pub(super) Arc<Mutex<RecordingWriter>>);

impl PacketWriter for SharedWriter {
    fn is_write_blocked(&self) -> bool {
        self.0.lock().unwrap().is_write_blocked()
    }

    fn set_writable(&mut self) {
        self.0.lock().unwrap().set_writable()
    }

    fn write_packet(&mut self, packet: &[u8], local: SocketAddr, peer: SocketAddr) -> WriteStatus {
        self.0.lock().unwrap().write_packet(packet, local, peer)
    }
}

/// A session as seen by the factory when it was created
#[derive(Debug, Clone)]
pub(super) struct CreatedSession {
    pub(super) server_cid: ConnectionId,
    pub(super) original_cid: ConnectionId,
    pub(super) client_cid: ConnectionId,
    pub(super) alpn: Option<Vec<u8>>,
    pub(super) chlo: ParsedClientHello,
}

/// Everything the test sessions and factory observed, plus knobs controlling them
#[derive(Default)]
pub(super) struct SessionLog {
    pub(super) created: Vec<CreatedSession>,
    /// Datagrams received, keyed by the receiving session's server ID
    pub(super) received: Vec<(ConnectionId, Bytes)>,
    pub(super) closed: Vec<(ConnectionId, TransportErrorCode, String)>,
    pub(super) can_write: Vec<ConnectionId>,
    pub(super) dropped: Vec<ConnectionId>,
    pub(super) rejected_cids: Vec<ConnectionId>,
    pub(super) rejections: usize,
    pub(super) stateless_closes: Vec<TransportErrorCode>,
    /// Events sessions report the next time the dispatcher polls them
    pub(super) pending_events: Vec<(ConnectionId, SessionEvent)>,
    pub(super) unroutable: Vec<ConnectionId>,
    pub(super) fail_creation: bool,
    /// Sessions answer every datagram with an echo
    pub(super) echo: bool,
    /// Sessions ignore `close`
    pub(super) ignore_close: bool,
    pub(super) handshake_complete: bool,
    pub(super) termination_packets: Vec<Bytes>,
}

pub(super) type SharedLog = Arc<Mutex<SessionLog>>;

pub(super) struct TestSession {
    server_cid: ConnectionId,
    original_cid: ConnectionId,
    client_cid: ConnectionId,
    version: u32,
    log: SharedLog,
    events: VecDeque<SessionEvent>,
    unsent: Vec<(Bytes, SocketAddr, SocketAddr)>,
}

impl TestSession {
    fn flush(&mut self, writer: &mut dyn PacketWriter) {
        while let Some((data, local, peer)) = self.unsent.first().cloned() {
            match writer.write_packet(&data, local, peer) {
                WriteStatus::Blocked => {
                    self.events.push_back(SessionEvent::WriteBlocked);
                    return;
                }
                _ => {
                    self.unsent.remove(0);
                }
            }
        }
    }
}

impl ServerSession for TestSession {
    fn process_datagram(
        &mut self,
        _now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        datagram: Bytes,
        writer: &mut dyn PacketWriter,
    ) {
        let echo = {
            let mut log = self.log.lock().unwrap();
            log.received.push((self.server_cid, datagram.clone()));
            log.echo
        };
        if echo {
            self.unsent.push((datagram, local, peer));
            self.flush(writer);
        }
    }

    fn on_can_write(&mut self, writer: &mut dyn PacketWriter) {
        self.log.lock().unwrap().can_write.push(self.server_cid);
        self.flush(writer);
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        let mut log = self.log.lock().unwrap();
        let mut i = 0;
        while i < log.pending_events.len() {
            if log.pending_events[i].0 == self.server_cid {
                let (_, event) = log.pending_events.remove(i);
                self.events.push_back(event);
            } else {
                i += 1;
            }
        }
        self.events.pop_front()
    }

    fn close(&mut self, code: TransportErrorCode, reason: &str) {
        let mut log = self.log.lock().unwrap();
        log.closed.push((self.server_cid, code, reason.into()));
        if !log.ignore_close {
            self.events.push_back(SessionEvent::Closed {
                code,
                reason: reason.into(),
                source: crate::CloseSource::Local,
            });
        }
    }

    fn is_handshake_complete(&self) -> bool {
        self.log.lock().unwrap().handshake_complete
    }

    fn take_termination_packets(&mut self) -> Vec<Bytes> {
        self.log.lock().unwrap().termination_packets.clone()
    }

    fn original_destination_connection_id(&self) -> ConnectionId {
        self.original_cid
    }

    fn peer_connection_id(&self) -> ConnectionId {
        self.client_cid
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn connection_id_rejected(&mut self, cid: ConnectionId) {
        self.log.lock().unwrap().rejected_cids.push(cid);
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.dropped.push(self.server_cid);
        }
    }
}

pub(super) struct TestFactory {
    pub(super) log: SharedLog,
}

impl SessionFactory for TestFactory {
    fn create_session(&mut self, params: NewSession<'_>) -> Option<Box<dyn ServerSession>> {
        let mut log = self.log.lock().unwrap();
        if log.fail_creation {
            return None;
        }
        info!(server_cid = %params.server_cid, "creating test session");
        log.created.push(CreatedSession {
            server_cid: params.server_cid,
            original_cid: params.original_cid,
            client_cid: params.client_cid,
            alpn: params.alpn.clone(),
            chlo: params.chlo.clone(),
        });
        Some(Box::new(TestSession {
            server_cid: params.server_cid,
            original_cid: params.original_cid,
            client_cid: params.client_cid,
            version: params.version,
            log: self.log.clone(),
            events: VecDeque::new(),
            unsent: Vec::new(),
        }))
    }

    fn is_unroutable(&self, cid: &ConnectionId) -> bool {
        self.log.lock().unwrap().unroutable.contains(cid)
    }

    fn on_new_connection_rejected(&mut self) {
        self.log.lock().unwrap().rejections += 1;
    }

    fn on_stateless_close_generated(&mut self, code: TransportErrorCode) {
        self.log.lock().unwrap().stateless_closes.push(code);
    }
}

/// First payload byte of a test Initial packet: more ClientHello to come
pub(super) const FRAGMENT: u8 = 0x00;
/// First payload byte of a test Initial packet: the ClientHello is complete
pub(super) const COMPLETE: u8 = 0x01;
/// First payload byte of a test Initial packet: the ClientHello carries a `decode_error`
pub(super) const BAD_CHLO: u8 = 0x02;

/// Reads the ClientHello state from the first payload byte of unprotected test packets
pub(super) struct MarkerExtractorFactory;

impl ExtractorFactory for MarkerExtractorFactory {
    fn new_extractor(&self, _: u32, _: &ConnectionId) -> Box<dyn HandshakeExtractor> {
        Box::new(MarkerExtractor { fragments: 0 })
    }
}

struct MarkerExtractor {
    fragments: usize,
}

impl HandshakeExtractor for MarkerExtractor {
    fn ingest(&mut self, header: &PublicHeader, datagram: &[u8]) -> Extraction {
        if !header.is_initial() {
            return Extraction::Incomplete;
        }
        let Some(&marker) = header.pn_offset.and_then(|offset| datagram.get(offset)) else {
            return Extraction::Incomplete;
        };
        self.fragments += 1;
        match marker {
            COMPLETE => Extraction::Complete(ParsedClientHello {
                sni: Some("localhost".into()),
                alpns: vec![b"h3".to_vec()],
                retry_token: header.retry_token.clone().filter(|t| !t.is_empty()),
                multi_packet: self.fragments > 1,
                ..ParsedClientHello::default()
            }),
            BAD_CHLO => Extraction::Fatal { alert: 50 },
            _ => Extraction::Incomplete,
        }
    }
}

/// Always replaces client-chosen IDs with the same one
pub(super) struct FixedReplacement(pub(super) ConnectionId);

impl ConnectionIdGenerator for FixedReplacement {
    fn generate_cid(&mut self) -> ConnectionId {
        self.0
    }

    fn maybe_replace(&mut self, _: &ConnectionId, _: u32) -> Option<ConnectionId> {
        Some(self.0)
    }

    fn cid_len(&self) -> usize {
        self.0.len()
    }
}

/// Unprotected long header packet of version 1 whose payload starts with `marker`
pub(super) fn long_packet(
    first_byte: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    marker: u8,
    size: usize,
) -> Bytes {
    let mut buf = Vec::with_capacity(size);
    buf.put_u8(first_byte);
    buf.put_u32(1);
    buf.put_u8(dst_cid.len() as u8);
    buf.put_slice(dst_cid);
    buf.put_u8(src_cid.len() as u8);
    buf.put_slice(src_cid);
    if first_byte & 0x30 == 0 {
        // empty token
        buf.put_u8(0);
    }
    let len_offset = buf.len();
    buf.put_u16(0);
    let pn_offset = buf.len();
    buf.put_u8(marker);
    buf.resize(size.max(buf.len()), 0);
    let len = (buf.len() - pn_offset) as u16;
    buf[len_offset..pn_offset].copy_from_slice(&(0x4000 | len).to_be_bytes());
    buf.into()
}

pub(super) fn initial(dst_cid: &ConnectionId, src_cid: &ConnectionId, marker: u8) -> Bytes {
    long_packet(0xc0, dst_cid, src_cid, marker, 1200)
}

pub(super) fn zero_rtt(dst_cid: &ConnectionId, src_cid: &ConnectionId) -> Bytes {
    long_packet(0xd0, dst_cid, src_cid, FRAGMENT, 200)
}

/// Short header packet for `dst_cid` padded to `size` bytes
pub(super) fn short(dst_cid: &ConnectionId, size: usize) -> Bytes {
    let mut buf = vec![0x40 | 0x01];
    buf.extend_from_slice(dst_cid);
    buf.resize(size.max(buf.len()), 0xab);
    buf.into()
}

/// Decrypt an Initial CONNECTION_CLOSE sent to a client whose first packet went to `odcid`
pub(super) fn open_close(packet: &[u8], odcid: &ConnectionId) -> (TransportErrorCode, String) {
    let suite = default_initial_suite().unwrap();
    let keys = InitialKeys::new(&suite, 1, odcid, Side::Client).unwrap();
    let header = PublicHeader::decode(packet, |_| 0, DEFAULT_SUPPORTED_VERSIONS).unwrap();
    assert!(header.is_initial());
    let mut packet = packet.to_vec();
    let (_, plain) = keys.open(&mut packet, header.pn_offset.unwrap(), 0).unwrap();
    let mut plain = Cursor::new(plain);
    assert_eq!(plain.get_var().unwrap(), 0x1c);
    let code = TransportErrorCode::decode(&mut plain).unwrap();
    plain.get_var().unwrap();
    let len = plain.get_var().unwrap() as usize;
    let reason = plain.get_slice(len).unwrap();
    (code, String::from_utf8(reason.to_vec()).unwrap())
}

pub(super) fn cid(byte: u8) -> ConnectionId {
    ConnectionId::new(&[byte; 8])
}

/// A dispatcher wired to recording collaborators, with a manual clock
pub(super) struct TestDispatcher {
    pub(super) dispatcher: Dispatcher,
    pub(super) log: SharedLog,
    pub(super) writer: SharedWriter,
    pub(super) time: Instant,
    pub(super) local: SocketAddr,
    pub(super) peer: SocketAddr,
}

impl TestDispatcher {
    pub(super) fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    /// Dispatcher reading ClientHello state from test packet markers
    pub(super) fn with_config(config: DispatcherConfig) -> Self {
        Self::build(|config, factory, writer| {
            Dispatcher::with_extractor(config, factory, Box::new(MarkerExtractorFactory), writer)
        }, config)
    }

    /// Dispatcher extracting real TLS ClientHellos
    pub(super) fn with_tls(config: DispatcherConfig) -> Self {
        Self::build(Dispatcher::new, config)
    }

    fn build(
        new: impl FnOnce(
            Arc<DispatcherConfig>,
            Box<dyn SessionFactory>,
            Box<dyn PacketWriter>,
        ) -> Dispatcher,
        config: DispatcherConfig,
    ) -> Self {
        let log = SharedLog::default();
        let writer = SharedWriter::default();
        let dispatcher = new(
            Arc::new(config),
            Box::new(TestFactory { log: log.clone() }),
            Box::new(writer.clone()),
        );
        Self {
            dispatcher,
            log,
            writer,
            time: Instant::now(),
            local: "[::1]:4433".parse().unwrap(),
            peer: "[::2]:7890".parse().unwrap(),
        }
    }

    /// Start an event loop iteration allowing `max` new sessions
    pub(super) fn allow_sessions(&mut self, max: usize) {
        self.dispatcher.process_buffered_chlos(self.time, max);
    }

    pub(super) fn recv(&mut self, data: Bytes) {
        let peer = self.peer;
        self.recv_from(peer, data);
    }

    pub(super) fn recv_from(&mut self, peer: SocketAddr, data: Bytes) {
        self.dispatcher
            .process_packet(self.time, self.local, peer, data);
    }

    /// Move the clock forward and fire expired timers
    pub(super) fn advance(&mut self, by: Duration) {
        self.time += by;
        self.dispatcher.handle_timeout(self.time);
    }

    /// Datagrams written so far, forgetting them
    pub(super) fn take_sent(&self) -> Vec<Bytes> {
        let mut writer = self.writer.0.lock().unwrap();
        writer.sent.drain(..).map(|p| p.data).collect()
    }

    pub(super) fn block_writes(&self) {
        self.writer.0.lock().unwrap().block();
    }

    pub(super) fn created(&self) -> Vec<CreatedSession> {
        self.log.lock().unwrap().created.clone()
    }

    /// Datagrams received by the session routed under `server_cid`
    pub(super) fn received_by(&self, server_cid: &ConnectionId) -> Vec<Bytes> {
        self.log
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(cid, _)| cid == server_cid)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Queue an event for the session routed under `server_cid`
    pub(super) fn push_event(&self, server_cid: ConnectionId, event: SessionEvent) {
        self.log
            .lock()
            .unwrap()
            .pending_events
            .push((server_cid, event));
    }
}
