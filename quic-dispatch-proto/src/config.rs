use std::{fmt, sync::Arc, time::Duration};

use rand::RngCore;
use rustls::quic::Suite;

use crate::{
    crypto::{self, HmacKey},
    ConnectionIdGenerator, RandomConnectionIdGenerator, DEFAULT_SUPPORTED_VERSIONS,
    MIN_INITIAL_SIZE,
};

/// Global configuration for the dispatcher, affecting all connections
///
/// Default values should be suitable for most internet applications. The size thresholds are
/// policy: they may be tuned, but the dispatcher never answers a datagram smaller than them.
#[derive(Clone)]
pub struct DispatcherConfig {
    /// CID generator factory
    ///
    /// Create a cid generator for the dispatcher. The generator decides which IDs new sessions
    /// are routed under, and how long short header destination IDs are.
    pub(crate) connection_id_generator_factory:
        Arc<dyn Fn() -> Box<dyn ConnectionIdGenerator> + Send + Sync>,
    pub(crate) reset_key: Arc<dyn HmacKey>,
    pub(crate) supported_versions: Vec<u32>,
    pub(crate) alpn_protocols: Vec<Vec<u8>>,
    /// Cipher suite protecting Initial packets; without it no connection close can be built
    pub(crate) initial_suite: Option<Suite>,

    /// Length assumed for short header destination IDs when the generator misjudged them
    pub(crate) fixed_short_header_cid_len: Option<usize>,
    pub(crate) allow_short_initial_cids: bool,
    pub(crate) validate_chlo_size: bool,
    pub(crate) buffer_chlos: bool,

    pub(crate) min_initial_size: usize,
    pub(crate) min_version_negotiation_size: usize,
    pub(crate) min_stateless_reset_size: usize,
    pub(crate) max_recent_reset_addresses: usize,
    pub(crate) recent_reset_address_lifetime: Duration,

    pub(crate) buffered_packet_lifetime: Duration,
    pub(crate) max_buffered_connections: usize,
    pub(crate) max_connections_without_chlo: usize,
    pub(crate) max_packets_per_connection: usize,

    pub(crate) time_wait_period: Duration,
    pub(crate) max_time_wait_connections: usize,
    pub(crate) max_time_wait_pending_packets: usize,
}

impl DispatcherConfig {
    /// Create a default config with a particular `reset_key`
    pub fn new(reset_key: Arc<dyn HmacKey>) -> Self {
        let cid_factory =
            || -> Box<dyn ConnectionIdGenerator> { Box::<RandomConnectionIdGenerator>::default() };
        Self {
            connection_id_generator_factory: Arc::new(cid_factory),
            reset_key,
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            alpn_protocols: Vec::new(),
            initial_suite: crypto::rustls::default_initial_suite(),

            fixed_short_header_cid_len: None,
            allow_short_initial_cids: false,
            validate_chlo_size: true,
            buffer_chlos: true,

            min_initial_size: usize::from(MIN_INITIAL_SIZE),
            min_version_negotiation_size: 1200,
            min_stateless_reset_size: 21,
            max_recent_reset_addresses: 1024,
            recent_reset_address_lifetime: Duration::from_millis(1000),

            buffered_packet_lifetime: Duration::from_secs(5),
            max_buffered_connections: 100,
            max_connections_without_chlo: 50,
            max_packets_per_connection: 16,

            time_wait_period: Duration::from_secs(200),
            max_time_wait_connections: 600_000,
            max_time_wait_pending_packets: 1024,
        }
    }

    /// Supply a custom connection ID generator factory
    ///
    /// Called once by the dispatcher on construction. The generator's length determines how
    /// short header packets are parsed, so it must stay consistent across restarts of a
    /// deployment that shares a port.
    pub fn cid_generator<F: Fn() -> Box<dyn ConnectionIdGenerator> + Send + Sync + 'static>(
        &mut self,
        factory: F,
    ) -> &mut Self {
        self.connection_id_generator_factory = Arc::new(factory);
        self
    }

    /// Private key used to derive stateless reset tokens
    pub fn reset_key(&mut self, key: Arc<dyn HmacKey>) -> &mut Self {
        self.reset_key = key;
        self
    }

    /// Override the versions new connections may use
    ///
    /// Packets with any other version are answered with version negotiation.
    pub fn supported_versions(&mut self, supported_versions: Vec<u32>) -> &mut Self {
        self.supported_versions = supported_versions;
        self
    }

    /// Application protocols the server speaks, in order of preference
    pub fn alpn_protocols(&mut self, protocols: Vec<Vec<u8>>) -> &mut Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Cipher suite used to protect connection closes sent before a session exists
    pub fn initial_suite(&mut self, suite: Suite) -> &mut Self {
        self.initial_suite = Some(suite);
        self
    }

    /// Retry short header packets that matched nothing with a fixed destination ID length
    pub fn fixed_short_header_cid_len(&mut self, len: Option<usize>) -> &mut Self {
        self.fixed_short_header_cid_len = len;
        self
    }

    /// Accept Initial packets whose destination ID is shorter than 8 bytes
    pub fn allow_short_initial_cids(&mut self, value: bool) -> &mut Self {
        self.allow_short_initial_cids = value;
        self
    }

    /// Drop Initial packets smaller than [`min_initial_size`](Self::min_initial_size)
    pub fn validate_chlo_size(&mut self, value: bool) -> &mut Self {
        self.validate_chlo_size = value;
        self
    }

    /// Buffer partial ClientHellos until they complete
    ///
    /// When disabled, a session is created for the first packet of every new connection.
    pub fn buffer_chlos(&mut self, value: bool) -> &mut Self {
        self.buffer_chlos = value;
        self
    }

    /// Smallest Initial packet accepted from a client
    pub fn min_initial_size(&mut self, value: usize) -> &mut Self {
        self.min_initial_size = value;
        self
    }

    /// Smallest packet with an unknown version that is answered with version negotiation
    pub fn min_version_negotiation_size(&mut self, value: usize) -> &mut Self {
        self.min_version_negotiation_size = value;
        self
    }

    /// Short header packets no larger than this are never answered with a stateless reset
    pub fn min_stateless_reset_size(&mut self, value: usize) -> &mut Self {
        self.min_stateless_reset_size = value;
        self
    }

    /// Number of peer addresses that may have received a stateless reset in one lifetime
    pub fn max_recent_reset_addresses(&mut self, value: usize) -> &mut Self {
        self.max_recent_reset_addresses = value;
        self
    }

    /// How long peer addresses that received a stateless reset are remembered
    pub fn recent_reset_address_lifetime(&mut self, value: Duration) -> &mut Self {
        self.recent_reset_address_lifetime = value;
        self
    }

    /// How long packets of a connection without a session may be buffered
    pub fn buffered_packet_lifetime(&mut self, value: Duration) -> &mut Self {
        self.buffered_packet_lifetime = value;
        self
    }

    /// Maximum number of connections with buffered packets
    pub fn max_buffered_connections(&mut self, value: usize) -> &mut Self {
        self.max_buffered_connections = value;
        self
    }

    /// Maximum number of connections with buffered packets but no complete ClientHello
    pub fn max_connections_without_chlo(&mut self, value: usize) -> &mut Self {
        self.max_connections_without_chlo = value;
        self
    }

    /// Maximum number of packets buffered per connection
    pub fn max_packets_per_connection(&mut self, value: usize) -> &mut Self {
        self.max_packets_per_connection = value;
        self
    }

    /// How long terminated connection IDs are remembered
    pub fn time_wait_period(&mut self, value: Duration) -> &mut Self {
        self.time_wait_period = value;
        self
    }

    /// Maximum number of connections in time-wait; the oldest are forgotten first
    pub fn max_time_wait_connections(&mut self, value: usize) -> &mut Self {
        self.max_time_wait_connections = value;
        self
    }

    /// Maximum number of time-wait responses queued while the socket is write-blocked
    pub fn max_time_wait_pending_packets(&mut self, value: usize) -> &mut Self {
        self.max_time_wait_pending_packets = value;
        self
    }

    /// Get the current value of `supported_versions`
    pub fn get_supported_versions(&self) -> &[u32] {
        &self.supported_versions
    }

    pub(crate) fn is_supported_version(&self, version: u32) -> bool {
        self.supported_versions.contains(&version)
    }
}

impl fmt::Debug for DispatcherConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DispatcherConfig")
            .field("reset_key", &"[ elided ]")
            .field("supported_versions", &self.supported_versions)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("initial_suite", &self.initial_suite.is_some())
            .field("fixed_short_header_cid_len", &self.fixed_short_header_cid_len)
            .field("allow_short_initial_cids", &self.allow_short_initial_cids)
            .field("validate_chlo_size", &self.validate_chlo_size)
            .field("buffer_chlos", &self.buffer_chlos)
            .field("min_initial_size", &self.min_initial_size)
            .field("buffered_packet_lifetime", &self.buffered_packet_lifetime)
            .field("max_buffered_connections", &self.max_buffered_connections)
            .field("time_wait_period", &self.time_wait_period)
            .finish_non_exhaustive()
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let mut reset_key = [0; 64];
        rand::thread_rng().fill_bytes(&mut reset_key);

        Self::new(Arc::new(ring::hmac::Key::new(
            ring::hmac::HMAC_SHA256,
            &reset_key,
        )))
    }
}
