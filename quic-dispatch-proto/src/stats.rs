/// Dispatcher statistics
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct DispatcherStats {
    /// Datagrams handed to the dispatcher
    pub packets_processed: u64,
    /// Datagrams dropped without any response
    pub packets_dropped: u64,
    /// Datagrams whose destination ID matched no session, buffer or time-wait entry
    pub packets_with_unknown_cid: u64,
    /// Datagrams buffered before their session existed
    pub packets_buffered: u64,
    /// Sessions created
    pub sessions_created: u64,
    /// Sessions closed and scheduled for deletion
    pub sessions_closed: u64,
    /// Version negotiation packets sent directly
    pub version_negotiations_sent: u64,
    /// Stateless resets sent for unversioned packets
    pub stateless_resets_sent: u64,
    /// Connections closed before a session existed
    pub stateless_closes: u64,
    /// New connections rejected while not accepting
    pub connections_rejected: u64,
    /// Connection ID replacements that collided with an existing connection
    pub cid_collisions: u64,
    /// Datagrams answered from the time-wait list
    pub time_wait_responses: u64,
}
