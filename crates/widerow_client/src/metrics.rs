//! In-process counters for mutation retries and read streams.
//!
//! Lock-free and shared by every `Table` handle cloned from the same client.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Aggregated client-side counters.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Number of mutate calls.
    mutate_calls: AtomicU64,
    /// Number of batch submissions across all mutate calls.
    mutate_attempts: AtomicU64,
    /// Entries re-submitted after a retryable status.
    retried_entries: AtomicU64,
    /// Entries that ended with a non-retryable status.
    terminal_failures: AtomicU64,
    /// Mutate calls that returned a partial failure.
    partial_failures: AtomicU64,
    read_streams: AtomicU64,
    chunks_received: AtomicU64,
    rows_emitted: AtomicU64,
    protocol_errors: AtomicU64,
    /// Read streams dropped or cancelled before the scan completed.
    read_cancellations: AtomicU64,
    sample_keys: AtomicU64,
}

/// Immutable snapshot view of [`ClientMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetricsSnapshot {
    pub mutate_calls: u64,
    pub mutate_attempts: u64,
    pub retried_entries: u64,
    pub terminal_failures: u64,
    pub partial_failures: u64,
    pub read_streams: u64,
    pub chunks_received: u64,
    pub rows_emitted: u64,
    pub protocol_errors: u64,
    pub read_cancellations: u64,
    pub sample_keys: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mutate_call(&self) {
        self.mutate_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutate_attempt(&self) {
        self.mutate_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried_entries(&self, count: u64) {
        self.retried_entries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_terminal_failure(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_failure(&self) {
        self.partial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_stream(&self) {
        self.read_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row(&self) {
        self.rows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_cancellation(&self) {
        self.read_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_key(&self) {
        self.sample_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            mutate_calls: self.mutate_calls.load(Ordering::Relaxed),
            mutate_attempts: self.mutate_attempts.load(Ordering::Relaxed),
            retried_entries: self.retried_entries.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            read_streams: self.read_streams.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            read_cancellations: self.read_cancellations.load(Ordering::Relaxed),
            sample_keys: self.sample_keys.load(Ordering::Relaxed),
        }
    }

    /// `key=value` lines, one counter per line.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "mutate_calls={}\nmutate_attempts={}\nmutate_retried_entries={}\nmutate_terminal_failures={}\nmutate_partial_failures={}\nread_streams={}\nread_chunks_received={}\nread_rows_emitted={}\nread_protocol_errors={}\nread_cancellations={}\nsample_keys={}\n",
            s.mutate_calls,
            s.mutate_attempts,
            s.retried_entries,
            s.terminal_failures,
            s.partial_failures,
            s.read_streams,
            s.chunks_received,
            s.rows_emitted,
            s.protocol_errors,
            s.read_cancellations,
            s.sample_keys,
        )
    }
}
