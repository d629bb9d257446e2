//! Per-channel statistics sink
//!
//! Plain atomic counters rather than a metrics-crate dependency: the core
//! only needs to count, and the mock broker logs these at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one channel's lifetime. Cheap to clone a handle to (it's
/// behind `Arc` wherever the channel hands one out) and safe to read from
/// another thread while the selector thread updates it.
#[derive(Debug, Default)]
pub struct Statistics {
    messages_sent: AtomicU64,
    duplicates_sent: AtomicU64,
    messages_received: AtomicU64,
    duplicates_received: AtomicU64,
    acks_received: AtomicU64,
    ack_latency_ms_total: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, duplicate: bool) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.duplicates_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_received(&self, duplicate: bool) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.duplicates_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_ack_latency_ms(&self, latency_ms: i64) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
        self.ack_latency_ms_total
            .fetch_add(latency_ms.max(0) as u64, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn duplicates_sent(&self) -> u64 {
        self.duplicates_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn duplicates_received(&self) -> u64 {
        self.duplicates_received.load(Ordering::Relaxed)
    }

    pub fn average_ack_latency_ms(&self) -> f64 {
        let acks = self.acks_received.load(Ordering::Relaxed);
        if acks == 0 {
            return 0.0;
        }
        self.ack_latency_ms_total.load(Ordering::Relaxed) as f64 / acks as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_sent_and_duplicate_counts() {
        let stats = Statistics::new();
        stats.record_sent(false);
        stats.record_sent(true);
        assert_eq!(stats.messages_sent(), 2);
        assert_eq!(stats.duplicates_sent(), 1);
    }

    #[test]
    fn averages_ack_latency() {
        let stats = Statistics::new();
        stats.record_ack_latency_ms(10);
        stats.record_ack_latency_ms(30);
        assert_eq!(stats.average_ack_latency_ms(), 20.0);
    }
}
