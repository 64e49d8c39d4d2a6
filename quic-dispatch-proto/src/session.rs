use std::{fmt, io, net::SocketAddr, time::Instant};

use bytes::Bytes;

use crate::{chlo::ParsedClientHello, shared::ConnectionId, ConnectionIdGenerator, TransportErrorCode};

/// A server-side connection the dispatcher routes datagrams to
///
/// Sessions run the per-connection protocol. The dispatcher only moves datagrams to them and
/// reacts to the [`SessionEvent`]s they report.
pub trait ServerSession: Send {
    /// Handle a datagram addressed to one of the session's connection IDs
    fn process_datagram(
        &mut self,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        datagram: Bytes,
        writer: &mut dyn PacketWriter,
    );

    /// The socket became writable after the session reported [`SessionEvent::WriteBlocked`]
    fn on_can_write(&mut self, writer: &mut dyn PacketWriter);

    /// Next event for the dispatcher, if any
    fn poll_event(&mut self) -> Option<SessionEvent>;

    /// Close the connection; the session must report [`SessionEvent::Closed`] afterwards
    fn close(&mut self, code: TransportErrorCode, reason: &str);

    /// Whether the handshake has been confirmed
    fn is_handshake_complete(&self) -> bool;

    /// Packets to replay to the peer while the connection's IDs are in time-wait
    fn take_termination_packets(&mut self) -> Vec<Bytes>;

    /// The destination ID the client chose for its first Initial packet
    fn original_destination_connection_id(&self) -> ConnectionId;

    /// The connection ID the peer asked us to send to
    fn peer_connection_id(&self) -> ConnectionId;

    /// QUIC version in use
    fn version(&self) -> u32;

    /// The dispatcher could not route `cid` to this session
    ///
    /// Sent in reply to [`SessionEvent::NewConnectionId`] when the ID is already taken.
    fn connection_id_rejected(&mut self, cid: ConnectionId) {
        let _ = cid;
    }
}

/// Events reported by sessions to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection is closed; the session will be deleted shortly
    Closed {
        /// Error code the connection was closed with
        code: TransportErrorCode,
        /// Human-readable explanation
        reason: String,
        /// Which side closed the connection
        source: CloseSource,
    },
    /// The session issued a new connection ID to its peer
    NewConnectionId(ConnectionId),
    /// The peer retired a connection ID
    RetireConnectionId(ConnectionId),
    /// A write was refused by the socket; call [`ServerSession::on_can_write`] later
    WriteBlocked,
}

/// Which side closed a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseSource {
    /// This server
    Local,
    /// The peer
    Peer,
}

/// Parameters for a new session
pub struct NewSession<'a> {
    /// ID the session is routed under
    pub server_cid: ConnectionId,
    /// Destination ID of the client's first packet
    pub original_cid: ConnectionId,
    /// Source ID of the client's first packet
    pub client_cid: ConnectionId,
    /// Address the datagram was received on
    pub local: SocketAddr,
    /// Address of the client
    pub peer: SocketAddr,
    /// QUIC version
    pub version: u32,
    /// Application protocol selected for the connection
    pub alpn: Option<Vec<u8>>,
    /// The client's ClientHello
    pub chlo: &'a ParsedClientHello,
    /// Generator for further connection IDs the session issues
    pub cid_generator: &'a mut dyn ConnectionIdGenerator,
}

impl fmt::Debug for NewSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSession")
            .field("server_cid", &self.server_cid)
            .field("original_cid", &self.original_cid)
            .field("client_cid", &self.client_cid)
            .field("peer", &self.peer)
            .field("version", &self.version)
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

/// Creates sessions for new connections and observes connection admission
pub trait SessionFactory: Send {
    /// Create a session, or `None` if it cannot be created
    fn create_session(&mut self, params: NewSession<'_>) -> Option<Box<dyn ServerSession>>;

    /// Whether packets for `cid` should be dropped before looking for a new connection
    fn is_unroutable(&self, cid: &ConnectionId) -> bool {
        let _ = cid;
        false
    }

    /// A new connection was rejected because the dispatcher is not accepting connections
    fn on_new_connection_rejected(&mut self) {}

    /// A connection was closed before any session existed for it
    fn on_stateless_close_generated(&mut self, code: TransportErrorCode) {
        let _ = code;
    }
}

/// Outcome of writing one datagram
#[derive(Debug)]
pub enum WriteStatus {
    /// The datagram was handed to the socket
    Ok(usize),
    /// The socket is full; the datagram was not sent
    Blocked,
    /// The socket failed
    Error(io::Error),
}

/// The socket datagrams are written to, shared by the dispatcher and all sessions
pub trait PacketWriter: Send {
    /// Whether the last write was refused and [`set_writable`](Self::set_writable) has not
    /// been called since
    fn is_write_blocked(&self) -> bool;

    /// The socket reported it can accept writes again
    fn set_writable(&mut self);

    /// Send `packet` from `local` to `peer`
    fn write_packet(&mut self, packet: &[u8], local: SocketAddr, peer: SocketAddr)
        -> WriteStatus;
}
