//! Metrics collection for the relay
//!
//! Thread-safe counters using atomic operations. Tracks requests, buffer
//! hits/misses, upstream fetches, re-resolutions, read-ahead and byte flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the relay
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Request statistics
    total_requests: AtomicU64,
    failed_requests: AtomicU64,

    // Buffer statistics
    buffer_hits: AtomicU64,
    buffer_misses: AtomicU64,
    buffer_resets: AtomicU64,

    // Upstream statistics
    upstream_fetches: AtomicU64,
    upstream_failures: AtomicU64,
    reresolutions: AtomicU64,
    resolutions: AtomicU64,
    read_aheads_started: AtomicU64,
    read_aheads_failed: AtomicU64,

    // Byte statistics
    bytes_from_upstream: AtomicU64,
    bytes_from_buffer: AtomicU64,
    bytes_to_client: AtomicU64,

    // Latency (microseconds)
    total_request_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub buffer_hits: u64,
    pub buffer_misses: u64,
    pub buffer_resets: u64,
    pub upstream_fetches: u64,
    pub upstream_failures: u64,
    pub reresolutions: u64,
    pub resolutions: u64,
    pub read_aheads_started: u64,
    pub read_aheads_failed: u64,
    pub bytes_from_upstream: u64,
    pub bytes_from_buffer: u64,
    pub bytes_to_client: u64,
    pub total_request_duration_us: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished request
    pub fn record_request(&self, success: bool, duration: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_buffer_hit(&self) {
        self.buffer_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_miss(&self) {
        self.buffer_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer reset caused by a client seek
    pub fn record_buffer_reset(&self) {
        self.buffer_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream fetch attempt
    pub fn record_upstream_fetch(&self, success: bool) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an invalidate + re-resolve after an authorization failure
    pub fn record_reresolution(&self) {
        self.reresolutions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an extractor invocation
    pub fn record_resolution(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_ahead_started(&self) {
        self.read_aheads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_ahead_failed(&self) {
        self.read_aheads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_upstream(&self, bytes: u64) {
        self.bytes_from_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_from_buffer(&self, bytes: u64) {
        self.bytes_from_buffer.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so the snapshot may be slightly
    /// inconsistent under concurrent updates.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            buffer_misses: self.buffer_misses.load(Ordering::Relaxed),
            buffer_resets: self.buffer_resets.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            reresolutions: self.reresolutions.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            read_aheads_started: self.read_aheads_started.load(Ordering::Relaxed),
            read_aheads_failed: self.read_aheads_failed.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            bytes_from_buffer: self.bytes_from_buffer.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Buffer hit rate as a percentage (0.0 to 100.0)
    pub fn buffer_hit_rate(&self) -> f64 {
        let total = self.buffer_hits + self.buffer_misses;
        if total == 0 {
            0.0
        } else {
            (self.buffer_hits as f64 / total as f64) * 100.0
        }
    }

    /// Average request duration in milliseconds
    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    /// Render in Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let counters = [
            ("requests_total", "Total number of stream requests", self.total_requests),
            ("failed_requests_total", "Stream requests answered with an error", self.failed_requests),
            ("buffer_hits_total", "Ranges served from memory", self.buffer_hits),
            ("buffer_misses_total", "Ranges fetched from upstream", self.buffer_misses),
            ("buffer_resets_total", "Buffers reset by a seek", self.buffer_resets),
            ("upstream_fetches_total", "Upstream range fetches", self.upstream_fetches),
            ("upstream_failures_total", "Failed upstream range fetches", self.upstream_failures),
            ("reresolutions_total", "Re-resolutions after authorization failures", self.reresolutions),
            ("resolutions_total", "Extractor invocations", self.resolutions),
            ("read_aheads_started_total", "Background read-ahead fetches started", self.read_aheads_started),
            ("read_aheads_failed_total", "Background read-ahead fetches that failed", self.read_aheads_failed),
            ("bytes_from_upstream_total", "Bytes received from upstream", self.bytes_from_upstream),
            ("bytes_from_buffer_total", "Bytes served from memory", self.bytes_from_buffer),
            ("bytes_to_client_total", "Bytes sent to clients", self.bytes_to_client),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP audio_relay_{} {}\n", name, help));
            output.push_str(&format!("# TYPE audio_relay_{} counter\n", name));
            output.push_str(&format!("audio_relay_{} {}\n\n", name, value));
        }

        output.push_str("# HELP audio_relay_buffer_hit_rate Buffer hit rate percentage\n");
        output.push_str("# TYPE audio_relay_buffer_hit_rate gauge\n");
        output.push_str(&format!("audio_relay_buffer_hit_rate {:.2}\n\n", self.buffer_hit_rate()));

        output.push_str("# HELP audio_relay_request_duration_ms_avg Average request duration in milliseconds\n");
        output.push_str("# TYPE audio_relay_request_duration_ms_avg gauge\n");
        output.push_str(&format!(
            "audio_relay_request_duration_ms_avg {:.2}\n",
            self.avg_request_duration_ms()
        ));

        output
    }
}
