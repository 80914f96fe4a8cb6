use std::time::{Duration, Instant};

/// Decides when accumulated progress is worth persisting and announcing.
///
/// Progress is flushed once `bytes_threshold` new bytes have arrived or
/// `interval` has elapsed since the last flush, whichever comes first.
#[derive(Debug, Clone)]
pub struct PersistThrottle {
    bytes_threshold: u64,
    interval: Duration,
    pending_bytes: u64,
    last_flush: Instant,
}

impl PersistThrottle {
    pub fn new(bytes_threshold: u64, interval: Duration) -> Self {
        Self {
            bytes_threshold,
            interval,
            pending_bytes: 0,
            last_flush: Instant::now(),
        }
    }

    /// Accounts for `bytes` of new progress; returns true when a flush is due.
    pub fn record(&mut self, bytes: u64) -> bool {
        self.pending_bytes += bytes;
        self.is_due()
    }

    /// Unflushed progress exists and a threshold has been crossed.
    pub fn is_due(&self) -> bool {
        self.is_dirty()
            && (self.pending_bytes >= self.bytes_threshold
                || self.last_flush.elapsed() >= self.interval)
    }

    pub fn is_dirty(&self) -> bool {
        self.pending_bytes > 0
    }

    /// Resets the counters after the state was written.
    pub fn flushed(&mut self) {
        self.pending_bytes = 0;
        self.last_flush = Instant::now();
    }
}
