//! Extraction of the TLS ClientHello from a client's first flight
//!
//! Sessions are expensive, so the dispatcher only creates one once it has seen the whole
//! ClientHello. An extractor removes Initial packet protection itself, reassembles CRYPTO frames
//! across datagrams and parses just enough of the ClientHello to pick a session.

use std::{collections::BTreeMap, io};

use bytes::{Buf, Bytes};
use rustls::quic::Suite;
use tracing::trace;

use crate::{
    coding::{self, BufExt},
    crypto::rustls::InitialKeys,
    packet::PublicHeader,
    shared::ConnectionId,
    Side,
};

/// Fields of a complete ClientHello the dispatcher and session factory care about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedClientHello {
    /// Server name indication
    pub sni: Option<String>,
    /// Application protocols offered, in client order
    pub alpns: Vec<Vec<u8>>,
    /// Key exchange groups offered
    pub supported_groups: Vec<u16>,
    /// Whether the client offered a pre-shared key
    pub resumption_attempted: bool,
    /// Whether the client intends to send early data
    pub early_data_attempted: bool,
    /// Token carried by the client's Initial packet
    pub retry_token: Option<Bytes>,
    /// Whether the ClientHello spanned more than one packet
    pub multi_packet: bool,
}

/// Result of feeding one datagram to a [`HandshakeExtractor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The whole ClientHello has been received
    Complete(ParsedClientHello),
    /// The ClientHello is unacceptable; close the connection with this TLS alert
    Fatal {
        /// TLS alert description code
        alert: u8,
    },
    /// More packets are needed
    Incomplete,
}

/// Accumulates a connection's first packets until the ClientHello is known
pub trait HandshakeExtractor: Send {
    /// Feed one datagram addressed to the connection
    fn ingest(&mut self, header: &PublicHeader, datagram: &[u8]) -> Extraction;
}

/// Creates one [`HandshakeExtractor`] per new connection
pub trait ExtractorFactory: Send {
    /// Start extracting for a connection whose client picked `dst_cid`
    fn new_extractor(&self, version: u32, dst_cid: &ConnectionId) -> Box<dyn HandshakeExtractor>;
}

/// Extracts ClientHellos sent in TLS over QUIC Initial packets
pub struct TlsExtractorFactory {
    suite: Option<Suite>,
}

impl TlsExtractorFactory {
    /// Extract with the given Initial cipher suite
    pub fn new(suite: Suite) -> Self {
        Self { suite: Some(suite) }
    }

    /// Without a suite every ClientHello fails with `internal_error`
    pub(crate) fn with_optional_suite(suite: Option<Suite>) -> Self {
        Self { suite }
    }
}

impl ExtractorFactory for TlsExtractorFactory {
    fn new_extractor(&self, version: u32, dst_cid: &ConnectionId) -> Box<dyn HandshakeExtractor> {
        Box::new(TlsChloExtractor {
            keys: self
                .suite
                .as_ref()
                .and_then(|suite| InitialKeys::new(suite, version, dst_cid, Side::Server).ok()),
            next_pn: 0,
            segments: BTreeMap::new(),
            crypto: Vec::new(),
            packets: 0,
            retry_token: None,
            state: State::Parsing,
        })
    }
}

struct TlsChloExtractor {
    keys: Option<InitialKeys>,
    /// Packet number expected next, for packet number expansion
    next_pn: u64,
    /// Out-of-order CRYPTO data keyed by stream offset
    segments: BTreeMap<u64, Bytes>,
    /// Contiguous CRYPTO stream prefix
    crypto: Vec<u8>,
    /// Initial packets successfully decrypted
    packets: usize,
    retry_token: Option<Bytes>,
    state: State,
}

enum State {
    Parsing,
    Complete(ParsedClientHello),
    Failed(u8),
}

impl HandshakeExtractor for TlsChloExtractor {
    fn ingest(&mut self, header: &PublicHeader, datagram: &[u8]) -> Extraction {
        match self.state {
            State::Complete(ref chlo) => return Extraction::Complete(chlo.clone()),
            State::Failed(alert) => return Extraction::Fatal { alert },
            State::Parsing => {}
        }
        if !header.is_initial() {
            return Extraction::Incomplete;
        }
        if self.keys.is_none() {
            return self.fail(ALERT_INTERNAL_ERROR);
        }
        let (Some(pn_offset), Some(len)) = (header.pn_offset, header.packet_len()) else {
            return Extraction::Incomplete;
        };

        let mut packet = datagram[..len].to_vec();
        let opened = match self.keys {
            Some(ref keys) => keys.open(&mut packet, pn_offset, self.next_pn),
            None => return Extraction::Incomplete,
        };
        let payload = match opened {
            Ok((pn, payload)) => {
                self.next_pn = self.next_pn.max(pn + 1);
                Bytes::copy_from_slice(payload)
            }
            Err(_) => {
                trace!("undecryptable Initial packet");
                return Extraction::Incomplete;
            }
        };
        if self.packets == 0 {
            self.retry_token = header.retry_token.clone().filter(|t| !t.is_empty());
        }
        self.packets += 1;

        if self.read_frames(payload).is_err() {
            trace!("malformed frames in Initial packet");
            return Extraction::Incomplete;
        }
        self.try_parse()
    }
}

impl TlsChloExtractor {
    fn fail(&mut self, alert: u8) -> Extraction {
        self.state = State::Failed(alert);
        Extraction::Fatal { alert }
    }

    /// Collect CRYPTO frames from a decrypted Initial payload
    fn read_frames(&mut self, mut buf: Bytes) -> coding::Result<()> {
        while buf.has_remaining() {
            match buf.get_var()? {
                FRAME_PADDING | FRAME_PING => {}
                ty @ (FRAME_ACK | FRAME_ACK_ECN) => {
                    // largest acknowledged, ack delay
                    buf.get_var()?;
                    buf.get_var()?;
                    let ranges = buf.get_var()?;
                    // first range
                    buf.get_var()?;
                    for _ in 0..ranges {
                        buf.get_var()?;
                        buf.get_var()?;
                    }
                    if ty == FRAME_ACK_ECN {
                        for _ in 0..3 {
                            buf.get_var()?;
                        }
                    }
                }
                FRAME_CRYPTO => {
                    let offset = buf.get_var()?;
                    let len = buf.get_var()? as usize;
                    let data = buf.get_slice(len)?;
                    self.insert_crypto(offset, data);
                }
                FRAME_CONNECTION_CLOSE => {
                    buf.get_var()?;
                    buf.get_var()?;
                    let len = buf.get_var()? as usize;
                    buf.get_slice(len)?;
                }
                // Nothing else may appear in an Initial packet
                _ => return Err(coding::UnexpectedEnd),
            }
        }
        Ok(())
    }

    fn insert_crypto(&mut self, offset: u64, data: Bytes) {
        let end = offset.saturating_add(data.len() as u64);
        if end > MAX_CHLO_SIZE || end <= self.crypto.len() as u64 {
            return;
        }
        self.segments.insert(offset, data);
        while let Some(entry) = self.segments.first_entry() {
            let start = *entry.key();
            let have = self.crypto.len() as u64;
            if start > have {
                break;
            }
            let data = entry.remove();
            let skip = (have - start) as usize;
            if skip < data.len() {
                self.crypto.extend_from_slice(&data[skip..]);
            }
        }
    }

    fn try_parse(&mut self) -> Extraction {
        if self.crypto.len() < 4 {
            return Extraction::Incomplete;
        }
        if self.crypto[0] != HANDSHAKE_CLIENT_HELLO {
            return self.fail(ALERT_UNEXPECTED_MESSAGE);
        }
        let len = u32::from_be_bytes([0, self.crypto[1], self.crypto[2], self.crypto[3]]) as usize;
        if 4 + len > MAX_CHLO_SIZE as usize {
            return self.fail(ALERT_DECODE_ERROR);
        }
        if self.crypto.len() < 4 + len {
            return Extraction::Incomplete;
        }

        match parse_client_hello(&self.crypto[4..4 + len]) {
            Ok(mut chlo) => {
                chlo.retry_token = self.retry_token.clone();
                chlo.multi_packet = self.packets > 1;
                self.state = State::Complete(chlo.clone());
                Extraction::Complete(chlo)
            }
            Err(alert) => self.fail(alert),
        }
    }
}

/// Parse the body of a ClientHello handshake message
///
/// Errors are TLS alert codes.
fn parse_client_hello(body: &[u8]) -> Result<ParsedClientHello, u8> {
    let decode_error = |_: coding::UnexpectedEnd| ALERT_DECODE_ERROR;
    let mut buf = io::Cursor::new(body);
    let mut chlo = ParsedClientHello::default();

    // legacy_version, random
    buf.get_slice(2 + 32).map_err(decode_error)?;
    let session_id_len = buf.get::<u8>().map_err(decode_error)?;
    if session_id_len > 32 {
        return Err(ALERT_DECODE_ERROR);
    }
    buf.get_slice(usize::from(session_id_len))
        .map_err(decode_error)?;
    let suites_len = buf.get::<u16>().map_err(decode_error)?;
    if suites_len == 0 || suites_len % 2 != 0 {
        return Err(ALERT_DECODE_ERROR);
    }
    buf.get_slice(usize::from(suites_len)).map_err(decode_error)?;
    let compression_len = buf.get::<u8>().map_err(decode_error)?;
    buf.get_slice(usize::from(compression_len))
        .map_err(decode_error)?;

    if !buf.has_remaining() {
        // TLS 1.3 clients always send extensions
        return Err(ALERT_MISSING_EXTENSION);
    }
    let extensions_len = buf.get::<u16>().map_err(decode_error)?;
    let mut extensions = buf
        .get_slice(usize::from(extensions_len))
        .map_err(decode_error)?;
    if buf.has_remaining() {
        return Err(ALERT_DECODE_ERROR);
    }

    let mut seen = Vec::new();
    while extensions.has_remaining() {
        let ty = extensions.get::<u16>().map_err(decode_error)?;
        let len = extensions.get::<u16>().map_err(decode_error)?;
        let mut data = extensions
            .get_slice(usize::from(len))
            .map_err(decode_error)?;
        if seen.contains(&ty) {
            return Err(ALERT_ILLEGAL_PARAMETER);
        }
        seen.push(ty);

        match ty {
            EXT_SERVER_NAME => chlo.sni = parse_server_name(&mut data)?,
            EXT_SUPPORTED_GROUPS => {
                let len = data.get::<u16>().map_err(decode_error)?;
                let mut groups = data.get_slice(usize::from(len)).map_err(decode_error)?;
                if groups.remaining() % 2 != 0 {
                    return Err(ALERT_DECODE_ERROR);
                }
                while groups.has_remaining() {
                    chlo.supported_groups.push(groups.get_u16());
                }
            }
            EXT_ALPN => {
                let len = data.get::<u16>().map_err(decode_error)?;
                let mut list = data.get_slice(usize::from(len)).map_err(decode_error)?;
                while list.has_remaining() {
                    let len = list.get::<u8>().map_err(decode_error)?;
                    if len == 0 {
                        return Err(ALERT_DECODE_ERROR);
                    }
                    let proto = list.get_slice(usize::from(len)).map_err(decode_error)?;
                    chlo.alpns.push(proto.to_vec());
                }
            }
            EXT_PRE_SHARED_KEY => chlo.resumption_attempted = true,
            EXT_EARLY_DATA => chlo.early_data_attempted = true,
            _ => {}
        }
    }
    Ok(chlo)
}

fn parse_server_name(data: &mut Bytes) -> Result<Option<String>, u8> {
    let decode_error = |_: coding::UnexpectedEnd| ALERT_DECODE_ERROR;
    let len = data.get::<u16>().map_err(decode_error)?;
    let mut list = data.get_slice(usize::from(len)).map_err(decode_error)?;
    let mut sni = None;
    while list.has_remaining() {
        let name_type = list.get::<u8>().map_err(decode_error)?;
        let len = list.get::<u16>().map_err(decode_error)?;
        let name = list.get_slice(usize::from(len)).map_err(decode_error)?;
        if name_type == 0 && sni.is_none() {
            let name = String::from_utf8(name.to_vec()).map_err(|_| ALERT_DECODE_ERROR)?;
            sni = Some(name);
        }
    }
    Ok(sni)
}

/// Human-readable name of a TLS alert
pub(crate) fn alert_name(alert: u8) -> String {
    format!("{:?}", rustls::AlertDescription::from(alert))
}

const MAX_CHLO_SIZE: u64 = 64 * 1024;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;

const FRAME_PADDING: u64 = 0x00;
const FRAME_PING: u64 = 0x01;
const FRAME_ACK: u64 = 0x02;
const FRAME_ACK_ECN: u64 = 0x03;
const FRAME_CRYPTO: u64 = 0x06;
const FRAME_CONNECTION_CLOSE: u64 = 0x1c;

const EXT_SERVER_NAME: u16 = 0;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_ALPN: u16 = 16;
const EXT_PRE_SHARED_KEY: u16 = 41;
const EXT_EARLY_DATA: u16 = 42;

const ALERT_UNEXPECTED_MESSAGE: u8 = 10;
const ALERT_ILLEGAL_PARAMETER: u8 = 47;
const ALERT_DECODE_ERROR: u8 = 50;
const ALERT_INTERNAL_ERROR: u8 = 80;
const ALERT_MISSING_EXTENSION: u8 = 109;
