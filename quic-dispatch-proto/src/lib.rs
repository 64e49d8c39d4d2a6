//! Sans-I/O server-side connection dispatcher for QUIC
//!
//! The [`Dispatcher`] receives every datagram arriving on a shared UDP socket and decides which
//! session it belongs to. Sessions themselves are supplied by the application through
//! [`SessionFactory`]; the dispatcher only routes, buffers and answers statelessly.
//!
//! Nothing here performs I/O or reads the clock. Datagrams are written through a
//! [`PacketWriter`] owned by the dispatcher, and timers are expressed as deadlines.

#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

#[cfg(test)]
mod tests;

// wire basics
pub mod coding;
mod varint;
pub use varint::{VarInt, VarIntBoundsExceeded};

mod packet;
pub use crate::packet::{HeaderForm, LongType, PacketDecodeError, PublicHeader};

mod shared;
pub use crate::shared::ConnectionId;

mod cid_generator;
pub use crate::cid_generator::{
    ConnectionIdGenerator, HashedConnectionIdGenerator, RandomConnectionIdGenerator,
};

mod config;
pub use crate::config::DispatcherConfig;

pub mod crypto;

mod token;
pub use crate::token::ResetToken;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

mod chlo;
pub use crate::chlo::{
    ExtractorFactory, Extraction, HandshakeExtractor, ParsedClientHello, TlsExtractorFactory,
};

mod session;
pub use crate::session::{
    CloseSource, NewSession, PacketWriter, ServerSession, SessionEvent, SessionFactory,
    WriteStatus,
};

mod buffered_packets;

mod time_wait;
pub use crate::time_wait::TimeWaitAction;

mod dispatcher;
pub use crate::dispatcher::{Dispatcher, ProcessError, SessionHandle};

mod stats;
pub use crate::stats::DispatcherStats;

/// Longest connection ID any QUIC version may use
const MAX_CID_SIZE: usize = 20;
const RESET_TOKEN_SIZE: usize = 16;
/// <https://www.rfc-editor.org/rfc/rfc9000.html#name-datagram-size>
const MIN_INITIAL_SIZE: u16 = 1200;
/// Clients must pick destination IDs at least this long for their first Initial packet
const MIN_INITIAL_CID_LEN: usize = 8;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

/// The QUIC protocol versions the dispatcher accepts by default
pub const DEFAULT_SUPPORTED_VERSIONS: &[u32] = &[
    0x00000001,
    0xff00_001d,
    0xff00_001e,
    0xff00_001f,
    0xff00_0020,
    0xff00_0021,
    0xff00_0022,
];
