//! Pipeline counters: lock-free totals plus one guarded cell for the queue
//! accounting the scheduler keeps exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Monotonic counters for monitoring. Updated with relaxed atomics; consumers
/// only ever need a snapshot.
#[derive(Debug, Default)]
pub struct FetchMetrics {
    pub http_requests: AtomicU64,
    pub http_success: AtomicU64,
    pub http_failed: AtomicU64,
    pub http_bytes: AtomicU64,
    pub udp_packets: AtomicU64,
    pub udp_request_batches: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_writes: AtomicU64,
    pub decodes: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl FetchMetrics {
    pub fn new() -> Arc<FetchMetrics> {
        Arc::new(FetchMetrics::default())
    }

    pub fn record_http(&self, success: bool, bytes: u64) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.http_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.http_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.http_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests: self.http_requests.load(Ordering::Relaxed),
            http_success: self.http_success.load(Ordering::Relaxed),
            http_failed: self.http_failed.load(Ordering::Relaxed),
            http_bytes: self.http_bytes.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            udp_request_batches: self.udp_request_batches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            decodes: self.decodes.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub http_requests: u64,
    pub http_success: u64,
    pub http_failed: u64,
    pub http_bytes: u64,
    pub udp_packets: u64,
    pub udp_request_batches: u64,
    pub cache_hits: u64,
    pub cache_writes: u64,
    pub decodes: u64,
    pub decode_failures: u64,
}

/// Exact queue accounting shared by every per-service queue of one registry.
///
/// Lock order: always taken after the owning queue's lock, never before.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub total_queued: usize,
    pub total_active: usize,
    pub total_added: u64,
}

pub type SharedQueueStats = Arc<Mutex<QueueStats>>;

pub fn new_queue_stats() -> SharedQueueStats {
    Arc::new(Mutex::new(QueueStats::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http() {
        let m = FetchMetrics::new();
        m.record_http(true, 100);
        m.record_http(false, 0);
        let s = m.snapshot();
        assert_eq!(s.http_requests, 2);
        assert_eq!(s.http_success, 1);
        assert_eq!(s.http_failed, 1);
        assert_eq!(s.http_bytes, 100);
    }
}
