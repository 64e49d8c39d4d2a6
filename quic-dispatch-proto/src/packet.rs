use std::io;

use bytes::{Buf, BufMut, Bytes};
use rand::{Rng, RngCore};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt, Codec},
    crypto::{rustls::InitialKeys, CryptoError},
    shared::ConnectionId,
    token::ResetToken,
    transport_error::Code,
    MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use self::PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 if r.remaining() >= 3 => U24(r.get_uint(3) as u32),
            3 => return Err(coding::UnexpectedEnd.into()),
            4 => U32(r.get()?),
            _ => return Err(PacketDecodeError::InvalidHeader("bad packet number length")),
        };
        Ok(pn)
    }

    pub(crate) fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Reasons a datagram's public header could not be decoded
#[derive(Debug, Error, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PacketDecodeError {
    /// The header is truncated or internally inconsistent
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

/// Whether a packet carries the long (versioned) or short header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderForm {
    /// Long header, always carries a version
    Long,
    /// Short header, no version
    Short,
}

/// Long packet types, for versions we understand
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    /// Carries the client's first flight
    Initial,
    /// Early data sent before the handshake completes
    ZeroRtt,
    /// Handshake packet
    Handshake,
    /// Retry packet
    Retry,
}

impl LongType {
    fn from_first_byte(first: u8) -> Self {
        match (first >> 4) & 0x03 {
            0 => Self::Initial,
            1 => Self::ZeroRtt,
            2 => Self::Handshake,
            _ => Self::Retry,
        }
    }
}

/// The version-invariant fields of a received datagram's first packet
///
/// Decoding never removes packet protection. For versions we support, the fields needed to
/// find the protected packet number of Initial packets are recorded as well.
#[derive(Debug, Clone)]
pub struct PublicHeader {
    /// Header form
    pub form: HeaderForm,
    /// Version field, `None` for short headers
    pub version: Option<u32>,
    /// Destination connection ID
    pub dst_cid: ConnectionId,
    /// Source connection ID, empty for short headers
    pub src_cid: ConnectionId,
    /// Long packet type, known only for supported versions
    pub long_type: Option<LongType>,
    /// Retry token carried by an Initial packet
    pub retry_token: Option<Bytes>,
    /// Offset of the protected packet number in the datagram
    pub(crate) pn_offset: Option<usize>,
    /// Value of the length field: packet number plus protected payload
    pub(crate) payload_len: Option<usize>,
}

impl PublicHeader {
    /// Decode the public header at the start of `datagram`
    ///
    /// The destination connection ID of a short header has no length on the wire;
    /// `short_cid_len` receives the first byte of that ID and returns its length.
    pub fn decode(
        datagram: &[u8],
        short_cid_len: impl Fn(u8) -> usize,
        supported_versions: &[u32],
    ) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(datagram);
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            let first_cid_byte = *datagram
                .get(1)
                .ok_or(PacketDecodeError::InvalidHeader("packet too small"))?;
            let len = short_cid_len(first_cid_byte);
            if len > MAX_CID_SIZE || buf.remaining() < len {
                return Err(PacketDecodeError::InvalidHeader("packet too small"));
            }
            return Ok(Self {
                form: HeaderForm::Short,
                version: None,
                dst_cid: ConnectionId::from_buf(&mut buf, len),
                src_cid: ConnectionId::default(),
                long_type: None,
                retry_token: None,
                pn_offset: None,
                payload_len: None,
            });
        }

        let version = buf.get::<u32>()?;
        let dst_cid = ConnectionId::decode_long(&mut buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed cid"))?;
        let src_cid = ConnectionId::decode_long(&mut buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed cid"))?;
        let mut header = Self {
            form: HeaderForm::Long,
            version: Some(version),
            dst_cid,
            src_cid,
            long_type: None,
            retry_token: None,
            pn_offset: None,
            payload_len: None,
        };
        if version == 0 || !supported_versions.contains(&version) {
            return Ok(header);
        }

        let ty = LongType::from_first_byte(first);
        header.long_type = Some(ty);
        if ty == LongType::Retry {
            return Ok(header);
        }
        if ty == LongType::Initial {
            let token_len = buf.get_var()? as usize;
            header.retry_token = Some(buf.get_slice(token_len)?);
        }
        let payload_len = buf.get_var()? as usize;
        if payload_len > buf.remaining() {
            return Err(PacketDecodeError::InvalidHeader("payload longer than packet"));
        }
        header.pn_offset = Some(buf.position() as usize);
        header.payload_len = Some(payload_len);
        Ok(header)
    }

    /// Whether this is a version negotiation packet
    pub fn is_version_negotiation(&self) -> bool {
        self.version == Some(0)
    }

    /// Whether this is a long header Initial packet
    pub fn is_initial(&self) -> bool {
        self.long_type == Some(LongType::Initial)
    }

    /// Length of the datagram's first packet, if its header says
    pub(crate) fn packet_len(&self) -> Option<usize> {
        Some(self.pn_offset? + self.payload_len?)
    }
}

/// Encode a version negotiation packet answering a packet from `dst_cid` to `src_cid`
///
/// The IDs are given from the responder's point of view, so they are the inciting packet's IDs
/// swapped. An empty `versions` list tells the peer none of its versions can be served.
pub(crate) fn encode_version_negotiation(
    buf: &mut Vec<u8>,
    random: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    versions: &[u32],
) {
    buf.write(LONG_HEADER_FORM | random);
    buf.write::<u32>(0);
    dst_cid.encode_long(buf);
    src_cid.encode_long(buf);
    for &version in versions {
        buf.write(version);
    }
}

/// Encode a stateless reset no larger than `inciting_len - 1` bytes
///
/// Returns `false` if the inciting datagram is too small to answer.
pub(crate) fn encode_stateless_reset(
    buf: &mut Vec<u8>,
    rng: &mut impl RngCore,
    inciting_len: usize,
    token: &ResetToken,
) -> bool {
    /// Minimum amount of padding for the stateless reset to look like a short-header packet
    const MIN_PADDING_LEN: usize = 5;
    /// Prevents a peer from distinguishing resets of short-CID connections by their size
    const IDEAL_MIN_PADDING_LEN: usize = MIN_PADDING_LEN + MAX_CID_SIZE;

    let max_padding_len = match inciting_len.checked_sub(RESET_TOKEN_SIZE) {
        Some(headroom) if headroom > MIN_PADDING_LEN => headroom - 1,
        _ => return false,
    };
    let padding_len = if max_padding_len <= IDEAL_MIN_PADDING_LEN {
        max_padding_len
    } else {
        rng.gen_range(IDEAL_MIN_PADDING_LEN..max_padding_len)
    };
    let start = buf.len();
    buf.resize(start + padding_len, 0);
    rng.fill_bytes(&mut buf[start..]);
    buf[start] = FIXED_BIT | (buf[start] >> 2);
    buf.extend_from_slice(token);
    true
}

/// Assemble an Initial packet carrying a single transport CONNECTION_CLOSE frame
///
/// `dst_cid` and `src_cid` are the IDs the packet is sent with; `keys` must be the server's
/// Initial keys for the client's original destination ID.
pub(crate) fn encode_initial_close(
    buf: &mut Vec<u8>,
    keys: &InitialKeys,
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    code: Code,
    reason: &str,
) -> Result<(), CryptoError> {
    const PN_LEN: usize = 2;
    const MAX_REASON_LEN: usize = 256;
    const FRAME_CONNECTION_CLOSE: u64 = 0x1c;

    let reason = &reason.as_bytes()[..reason.len().min(MAX_REASON_LEN)];
    let mut payload = Vec::with_capacity(reason.len() + 16);
    payload.write_var(FRAME_CONNECTION_CLOSE);
    code.encode(&mut payload);
    // Frame type that triggered the error: none
    payload.write_var(0);
    payload.write_var(reason.len() as u64);
    payload.put_slice(reason);
    // The header protection sample starts four bytes after the packet number
    while PN_LEN + payload.len() < 4 {
        payload.put_u8(0);
    }

    let start = buf.len();
    let pn_offset = encode_initial_header(
        buf,
        version,
        dst_cid,
        src_cid,
        &[],
        PacketNumber::U16(0),
        payload.len() + keys.tag_len(),
    ) - start;
    let header_len = buf.len() - start;
    buf.extend_from_slice(&payload);

    let mut packet = buf.split_off(start);
    keys.seal(0, &mut packet, pn_offset, header_len)?;
    buf.extend_from_slice(&packet);
    Ok(())
}

/// Encode the long header of an Initial packet up to and including its packet number
///
/// Returns the offset of the packet number within `buf`. `payload_len` excludes the packet
/// number and includes the AEAD tag.
pub(crate) fn encode_initial_header(
    buf: &mut Vec<u8>,
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    token: &[u8],
    pn: PacketNumber,
    payload_len: usize,
) -> usize {
    buf.write(LONG_HEADER_FORM | FIXED_BIT | (pn.len() as u8 - 1));
    buf.write(version);
    dst_cid.encode_long(buf);
    src_cid.encode_long(buf);
    buf.write_var(token.len() as u64);
    buf.put_slice(token);
    let len = pn.len() + payload_len;
    debug_assert!(len < 0x4000);
    // Fixed 2-byte length keeps the header size independent of the payload
    buf.write::<u16>(0x4000 | len as u16);
    let pn_offset = buf.len();
    pn.encode(buf);
    pn_offset
}

pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
