//! Tokio driver for the QUIC connection dispatcher
//!
//! [`Server`] owns a UDP socket and a [`proto::Dispatcher`], feeding it every datagram the socket
//! receives, arming its timers and resuming it when the socket drains. Sessions are supplied by
//! the application through [`SessionFactory`](proto::SessionFactory).

use std::time::Duration;

macro_rules! ready {
    ($e:expr $(,)?) => {
        match $e {
            std::task::Poll::Ready(t) => t,
            std::task::Poll::Pending => return std::task::Poll::Pending,
        }
    };
}


mod io_budget;
mod runtime;
mod server;
mod writer;

#[cfg(feature = "runtime-tokio")]
pub use crate::runtime::TokioRuntime;
pub use crate::runtime::{default_runtime, AsyncTimer, AsyncUdpSocket, Runtime};
pub use crate::server::{Server, ServerClosed, ServerConfig, ServerDriver, ServerHandle};
pub use crate::writer::UdpPacketWriter;

pub use proto::{
    ConnectionId, Dispatcher, DispatcherConfig, DispatcherStats, NewSession, PacketWriter,
    ServerSession, SessionEvent, SessionFactory, TransportErrorCode, WriteStatus,
};

/// Maximum number of datagrams received per driver iteration before other work gets a turn
///
/// Keeps a flood on the socket from starving timers and buffered handshakes.
const IO_LOOP_BOUND: usize = 160;

/// The maximum amount of time that should be spent receiving per driver iteration
const RECV_TIME_BOUND: Duration = Duration::from_micros(50);

/// Size of the receive buffer; large enough for any UDP payload
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;
