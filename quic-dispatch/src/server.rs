use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use proto::{Dispatcher, DispatcherConfig, DispatcherStats, ExtractorFactory, SessionFactory};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, Instrument, Span};

use crate::{
    io_budget::IoBudget,
    runtime::{default_runtime, AsyncTimer, AsyncUdpSocket, Runtime},
    writer::UdpPacketWriter,
    IO_LOOP_BOUND, MAX_DATAGRAM_SIZE, RECV_TIME_BOUND,
};

/// Configuration of a [`Server`]
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) dispatcher: Arc<DispatcherConfig>,
    pub(crate) max_sessions_per_iteration: usize,
    pub(crate) max_datagrams_per_iteration: usize,
}

impl ServerConfig {
    /// Create a server configuration around a dispatcher configuration
    pub fn new(dispatcher: Arc<DispatcherConfig>) -> Self {
        Self {
            dispatcher,
            max_sessions_per_iteration: 16,
            max_datagrams_per_iteration: IO_LOOP_BOUND,
        }
    }

    /// Sessions created from buffered handshakes per driver iteration
    ///
    /// Handshakes beyond the budget wait for the next iteration, so a burst of new connections
    /// cannot stall traffic on established ones.
    pub fn max_sessions_per_iteration(&mut self, value: usize) -> &mut Self {
        self.max_sessions_per_iteration = value;
        self
    }

    /// Datagrams received per driver iteration before timers and writes get a turn
    pub fn max_datagrams_per_iteration(&mut self, value: usize) -> &mut Self {
        self.max_datagrams_per_iteration = value;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(Arc::new(DispatcherConfig::default()))
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("dispatcher", &self.dispatcher)
            .field("max_sessions_per_iteration", &self.max_sessions_per_iteration)
            .field("max_datagrams_per_iteration", &self.max_datagrams_per_iteration)
            .finish()
    }
}

/// A QUIC server: one UDP socket whose datagrams are routed by a [`Dispatcher`]
///
/// Nothing happens until the server is turned into a [`ServerDriver`] with [`run`](Self::run)
/// and polled, or handed to the runtime with [`spawn`](Self::spawn). Use a [`ServerHandle`] to
/// control it while it runs.
pub struct Server {
    dispatcher: Dispatcher,
    config: ServerConfig,
    socket: Arc<dyn AsyncUdpSocket>,
    runtime: Arc<dyn Runtime>,
    local: SocketAddr,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Server {
    /// Bind a UDP socket on `addr` and serve it
    ///
    /// If an IPv6 address is provided, attempts to make the socket dual-stack so that IPv4
    /// clients are served as well. Must be called from within a runtime context.
    pub fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        session_factory: Box<dyn SessionFactory>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            if let Err(e) = socket.set_only_v6(false) {
                debug!(%e, "unable to make socket dual-stack");
            }
        }
        socket.bind(&addr.into())?;
        let runtime = default_runtime()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no async runtime found"))?;
        let socket = runtime.wrap_udp_socket(socket.into())?;
        Self::new(config, session_factory, socket, runtime)
    }

    /// Serve an already constructed socket
    pub fn new(
        config: ServerConfig,
        session_factory: Box<dyn SessionFactory>,
        socket: Arc<dyn AsyncUdpSocket>,
        runtime: Arc<dyn Runtime>,
    ) -> io::Result<Self> {
        let writer = Box::new(UdpPacketWriter::new(socket.clone()));
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), session_factory, writer);
        Self::with_dispatcher(dispatcher, config, socket, runtime)
    }

    /// Serve an already constructed socket, assembling ClientHellos with `extractor_factory`
    pub fn with_extractor(
        config: ServerConfig,
        session_factory: Box<dyn SessionFactory>,
        extractor_factory: Box<dyn ExtractorFactory>,
        socket: Arc<dyn AsyncUdpSocket>,
        runtime: Arc<dyn Runtime>,
    ) -> io::Result<Self> {
        let writer = Box::new(UdpPacketWriter::new(socket.clone()));
        let dispatcher = Dispatcher::with_extractor(
            config.dispatcher.clone(),
            session_factory,
            extractor_factory,
            writer,
        );
        Self::with_dispatcher(dispatcher, config, socket, runtime)
    }

    fn with_dispatcher(
        dispatcher: Dispatcher,
        config: ServerConfig,
        socket: Arc<dyn AsyncUdpSocket>,
        runtime: Arc<dyn Runtime>,
    ) -> io::Result<Self> {
        let local = socket.local_addr()?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Ok(Self {
            dispatcher,
            config,
            socket,
            runtime,
            local,
            commands_tx,
            commands,
        })
    }

    /// The address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Obtain a handle for controlling the server once it runs
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// The dispatcher routing this server's datagrams
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Turn the server into the future that performs its I/O
    pub fn run(self) -> ServerDriver {
        let Self {
            dispatcher,
            config,
            socket,
            runtime,
            local,
            commands_tx: _,
            commands,
        } = self;
        ServerDriver {
            recv_budget: IoBudget::new(config.max_datagrams_per_iteration, RECV_TIME_BOUND),
            recv_buf: vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            timer: None,
            timer_deadline: None,
            dispatcher,
            config,
            socket,
            runtime,
            local,
            commands,
        }
    }

    /// Run the server in the background, returning a handle to control it
    pub fn spawn(self) -> ServerHandle {
        let handle = self.handle();
        let runtime = self.runtime.clone();
        let driver = self.run();
        runtime.spawn(Box::pin(
            async {
                if let Err(e) = driver.await {
                    error!("I/O error: {}", e);
                }
            }
            .instrument(Span::current()),
        ));
        handle
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local", &self.local)
            .field("sessions", &self.dispatcher.num_sessions())
            .finish_non_exhaustive()
    }
}

/// Controls a running [`Server`]
///
/// May be cloned freely. Dropping every handle leaves the server running until its driver is
/// dropped.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerHandle {
    /// Reject new connections and discard every buffered handshake
    pub fn stop_accepting_new_connections(&self) -> Result<(), ServerClosed> {
        self.send(Command::StopAccepting)
    }

    /// Resume accepting new connections
    pub fn start_accepting_new_connections(&self) -> Result<(), ServerClosed> {
        self.send(Command::StartAccepting)
    }

    /// Close every session and stop the driver
    pub fn shutdown(&self) -> Result<(), ServerClosed> {
        self.send(Command::Shutdown)
    }

    /// Fetch the dispatcher's statistics
    pub async fn stats(&self) -> Result<DispatcherStats, ServerClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| ServerClosed)
    }

    fn send(&self, command: Command) -> Result<(), ServerClosed> {
        self.commands.send(command).map_err(|_| ServerClosed)
    }
}

/// The server's driver is no longer running
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("server driver has stopped")]
pub struct ServerClosed;

#[derive(Debug)]
enum Command {
    StopAccepting,
    StartAccepting,
    Shutdown,
    Stats(oneshot::Sender<DispatcherStats>),
}

/// A future that drives I/O on a server
///
/// Each poll is one event loop iteration. Pending commands are applied first. Buffered
/// handshakes then get their share of new sessions, and datagrams are received within the
/// configured budget; handshakes completing in them only draw on what the buffered ones left.
/// Blocked writers resume once the socket drains, and expired deadlines fire last.
///
/// `ServerDriver` futures terminate after [`ServerHandle::shutdown`], or when an I/O error
/// occurs.
#[must_use = "server drivers must be polled for I/O to occur"]
pub struct ServerDriver {
    dispatcher: Dispatcher,
    config: ServerConfig,
    socket: Arc<dyn AsyncUdpSocket>,
    runtime: Arc<dyn Runtime>,
    local: SocketAddr,
    commands: mpsc::UnboundedReceiver<Command>,
    recv_budget: IoBudget,
    recv_buf: Box<[u8]>,
    timer: Option<Pin<Box<dyn AsyncTimer>>>,
    timer_deadline: Option<Instant>,
}

impl ServerDriver {
    /// Returns whether a shutdown was requested
    fn handle_commands(&mut self, cx: &mut Context, now: Instant) -> bool {
        for _ in 0..IO_LOOP_BOUND {
            let command = match self.commands.poll_recv(cx) {
                Poll::Ready(Some(command)) => command,
                Poll::Ready(None) | Poll::Pending => return false,
            };
            match command {
                Command::StopAccepting => self.dispatcher.stop_accepting_new_connections(),
                Command::StartAccepting => self.dispatcher.start_accepting_new_connections(),
                Command::Shutdown => {
                    info!(
                        sessions = self.dispatcher.num_sessions(),
                        time_wait = self.dispatcher.num_time_wait_connections(),
                        "shutting down"
                    );
                    self.dispatcher.shutdown(now);
                    return true;
                }
                Command::Stats(tx) => {
                    let _ = tx.send(self.dispatcher.stats());
                }
            }
        }
        cx.waker().wake_by_ref();
        false
    }

    /// Returns whether the budget ran out before the socket was drained
    fn drive_recv(&mut self, cx: &mut Context, now: Instant) -> io::Result<bool> {
        self.recv_budget.start(now);
        loop {
            match self.socket.poll_recv(cx, &mut self.recv_buf) {
                Poll::Ready(Ok((len, peer))) => {
                    let data = Bytes::copy_from_slice(&self.recv_buf[..len]);
                    self.dispatcher.process_packet(now, self.local, peer, data);
                }
                Poll::Pending => return Ok(false),
                // Ignore ECONNRESET as it's undefined in QUIC and may be injected by an
                // attacker
                Poll::Ready(Err(ref e)) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Poll::Ready(Err(e)) => return Err(e),
            }
            self.recv_budget.record(1);
            let runtime = &self.runtime;
            if !self.recv_budget.allows_more(|| runtime.now()) {
                return Ok(true);
            }
        }
    }

    /// Returns whether blocked writers remain that the socket was not polled for
    fn drive_writes(&mut self, cx: &mut Context, now: Instant) -> io::Result<bool> {
        for _ in 0..IO_LOOP_BOUND {
            if !self.dispatcher.has_pending_writes() {
                return Ok(false);
            }
            match self.socket.poll_writable(cx) {
                Poll::Ready(Ok(())) => self.dispatcher.on_can_write(now),
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => return Ok(false),
            }
        }
        Ok(self.dispatcher.has_pending_writes())
    }

    /// Returns whether a deadline fired
    fn drive_timer(&mut self, cx: &mut Context) -> bool {
        let Some(deadline) = self.dispatcher.poll_timeout() else {
            self.timer_deadline = None;
            return false;
        };
        if self.timer_deadline != Some(deadline) {
            match &mut self.timer {
                Some(timer) => timer.as_mut().reset(deadline),
                None => self.timer = Some(self.runtime.new_timer(deadline)),
            }
            self.timer_deadline = Some(deadline);
        }
        let Some(timer) = &mut self.timer else {
            return false;
        };
        if timer.as_mut().poll(cx).is_pending() {
            return false;
        }
        self.timer_deadline = None;
        self.dispatcher.handle_timeout(self.runtime.now());
        true
    }
}

impl Future for ServerDriver {
    type Output = Result<(), io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let driver = self.get_mut();
        let now = driver.runtime.now();

        if driver.handle_commands(cx, now) {
            return Poll::Ready(Ok(()));
        }

        // Resets the session budget, so it must come before receiving
        driver
            .dispatcher
            .process_buffered_chlos(now, driver.config.max_sessions_per_iteration);
        let mut keep_going = driver.drive_recv(cx, now)?;
        keep_going |= driver.dispatcher.has_chlos_buffered();
        keep_going |= driver.drive_writes(cx, now)?;
        keep_going |= driver.drive_timer(cx);

        // If there is more work to do schedule the driver task again
        if keep_going {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

impl fmt::Debug for ServerDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDriver")
            .field("local", &self.local)
            .field("sessions", &self.dispatcher.num_sessions())
            .field("timer_deadline", &self.timer_deadline)
            .finish_non_exhaustive()
    }
}
