use std::time::{Duration, Instant};

/// Bounds the datagrams received in one driver iteration
///
/// An iteration ends once either `max_datagrams` have been received or `max_time` has passed
/// since [`start`](Self::start), whichever comes first. The clock is only read every
/// `CLOCK_INTERVAL` datagrams since a single receive is much cheaper than a clock read on some
/// platforms.
#[derive(Debug)]
pub(crate) struct IoBudget {
    max_datagrams: usize,
    max_time: Duration,
    received: usize,
    started: Option<Instant>,
}

impl IoBudget {
    pub(crate) fn new(max_datagrams: usize, max_time: Duration) -> Self {
        Self {
            max_datagrams: max_datagrams.max(1),
            max_time,
            received: 0,
            started: None,
        }
    }

    /// Begin an iteration
    pub(crate) fn start(&mut self, now: Instant) {
        self.received = 0;
        self.started = Some(now);
    }

    /// Records that `n` datagrams were received
    pub(crate) fn record(&mut self, n: usize) {
        self.received += n;
    }

    /// Whether another datagram may be received in this iteration
    pub(crate) fn allows_more(&self, now: impl Fn() -> Instant) -> bool {
        if self.received >= self.max_datagrams {
            return false;
        }
        if self.received == 0 || self.received % CLOCK_INTERVAL != 0 {
            return true;
        }
        match self.started {
            Some(started) => now().saturating_duration_since(started) < self.max_time,
            None => true,
        }
    }
}

const CLOCK_INTERVAL: usize = 8;
