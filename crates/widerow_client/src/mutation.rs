//! Multi-row mutation with per-entry retry.
//!
//! A mutate call submits every entry in one batch, then re-submits only the
//! entries that reported a transient status, up to `max_retries` more times.
//! Entries are tracked by their index in the caller's sequence; the transport
//! reports results by position inside the batch that was actually sent, so
//! each attempt keeps the batch-to-original index mapping it was built from.
//!
//! The retry bookkeeping lives in `BatchAttemptState`, which is moved through
//! the attempt loop and has no I/O of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::StreamExt;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ClientConfig;
use crate::error::{ClientError, EntryFailure, PartialFailure};
use crate::metrics::ClientMetrics;
use crate::status::{Status, StatusCode};
use crate::transport::DataTransport;
use crate::types::MutationEntry;

/// Per-call retry and timeout settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutateOptions {
    /// Retries after the first attempt; `0` means exactly one attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Deadline for sending one batch and draining its results.
    pub attempt_timeout: Option<Duration>,
}

impl Default for MutateOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl MutateOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            attempt_timeout: config.rpc_timeout,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before attempt `completed + 1`, given `completed` finished attempts.
    pub fn backoff(&self, completed: u32) -> Duration {
        let exp = completed.saturating_sub(1).min(31);
        self.retry_base_delay
            .saturating_mul(1u32 << exp)
            .min(self.retry_max_delay)
    }
}

/// How one per-entry status changed the attempt state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    /// Transient status; the entry stays pending.
    Retry,
    /// Non-retryable status; the entry is final.
    Terminal,
    /// The entry was already resolved.
    Ignored,
}

/// Retry bookkeeping owned by a single mutate call.
#[derive(Clone, Debug)]
pub struct BatchAttemptState {
    /// Original indices still awaiting a final status.
    pending: BTreeSet<usize>,
    /// Last non-ok status per original index.
    errors: BTreeMap<usize, Status>,
    attempts_made: u32,
    last_transport_error: Option<String>,
}

impl BatchAttemptState {
    pub fn new(total_entries: usize) -> Self {
        Self {
            pending: (0..total_entries).collect(),
            errors: BTreeMap::new(),
            attempts_made: 0,
            last_transport_error: None,
        }
    }

    pub fn pending(&self) -> &BTreeSet<usize> {
        &self.pending
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn is_done(&self, max_retries: u32) -> bool {
        self.pending.is_empty() || self.attempts_made > max_retries
    }

    /// Count a new attempt and return the original indices it carries, in order.
    pub fn begin_attempt(&mut self) -> Vec<usize> {
        self.attempts_made += 1;
        self.pending.iter().copied().collect()
    }

    pub fn resolve(&mut self, index: usize, status: Status) -> Resolution {
        if !self.pending.contains(&index) {
            return Resolution::Ignored;
        }
        if status.is_ok() {
            self.pending.remove(&index);
            self.errors.remove(&index);
            Resolution::Succeeded
        } else if status.is_retryable() {
            self.errors.insert(index, status);
            Resolution::Retry
        } else {
            self.pending.remove(&index);
            self.errors.insert(index, status);
            Resolution::Terminal
        }
    }

    pub fn record_transport_error(&mut self, message: impl Into<String>) {
        self.last_transport_error = Some(message.into());
    }

    /// Final outcome; every entry that never reached `ok` is reported.
    pub fn into_outcome(
        self,
        entries: &[MutationEntry],
        cancelled: bool,
    ) -> Result<(), PartialFailure> {
        let mut failed: BTreeMap<usize, Status> = self.errors;
        for index in &self.pending {
            if failed.contains_key(index) {
                continue;
            }
            let status = match (&self.last_transport_error, cancelled) {
                (Some(message), false) => Status::new(StatusCode::Unavailable, message.clone()),
                (Some(message), true) => Status::new(StatusCode::Cancelled, message.clone()),
                (None, true) => Status::new(
                    StatusCode::Cancelled,
                    "mutation cancelled before the entry was resolved",
                ),
                (None, false) => Status::new(
                    StatusCode::Unavailable,
                    "no status received for entry",
                ),
            };
            failed.insert(*index, status);
        }
        if failed.is_empty() {
            return Ok(());
        }

        let failures = failed
            .into_iter()
            .filter_map(|(index, status)| {
                entries.get(index).map(|entry| EntryFailure {
                    index,
                    status,
                    entry: entry.clone(),
                })
            })
            .collect();
        Err(PartialFailure {
            failures,
            total_entries: entries.len(),
            attempts: self.attempts_made,
            cancelled,
        })
    }
}

#[derive(Debug, Default)]
struct AttemptTally {
    succeeded: usize,
    retryable: usize,
    terminal: usize,
    ignored: usize,
}

/// Drives the attempt loop for mutate calls against one table.
#[derive(Clone)]
pub struct MutationBatcher {
    transport: Arc<dyn DataTransport>,
    table: String,
    options: MutateOptions,
    metrics: Arc<ClientMetrics>,
}

impl MutationBatcher {
    pub fn new(
        transport: Arc<dyn DataTransport>,
        table: impl Into<String>,
        options: MutateOptions,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            transport,
            table: table.into(),
            options,
            metrics,
        }
    }

    pub async fn mutate(&self, entries: &[MutationEntry]) -> Result<(), ClientError> {
        self.mutate_with_cancel(entries, None).await
    }

    /// Like [`MutationBatcher::mutate`], but stops scheduling attempts once
    /// `cancel` fires. An attempt already in flight is always drained.
    pub async fn mutate_with_cancel(
        &self,
        entries: &[MutationEntry],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ClientError> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(index) = entries.iter().position(|entry| entry.key.is_empty()) {
            return Err(ClientError::invalid(format!(
                "mutation entry {index} has an empty row key"
            )));
        }

        self.metrics.record_mutate_call();
        let span = info_span!("mutate", table = %self.table, entries = entries.len());
        self.run(entries, cancel).instrument(span).await
    }

    async fn run(
        &self,
        entries: &[MutationEntry],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ClientError> {
        let max_retries = self.options.max_retries;
        let mut state = BatchAttemptState::new(entries.len());
        let mut cancelled = false;

        while !state.is_done(max_retries) {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                cancelled = true;
                break;
            }
            if state.attempts_made() > 0 {
                let delay = self.options.backoff(state.attempts_made());
                if !self.sleep_unless_cancelled(delay, cancel).await {
                    cancelled = true;
                    break;
                }
            }
            state = self.attempt(entries, state).await;
        }

        let attempts = state.attempts_made();
        match state.into_outcome(entries, cancelled) {
            Ok(()) => {
                debug!(attempts, "mutation complete");
                Ok(())
            }
            Err(failure) => {
                self.metrics.record_partial_failure();
                warn!(
                    attempts,
                    failed = failure.failures.len(),
                    cancelled,
                    "mutation finished with failed entries"
                );
                Err(ClientError::PartialFailure(failure))
            }
        }
    }

    /// Returns `false` when cancellation fired first.
    async fn sleep_unless_cancelled(
        &self,
        delay: Duration,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = time::sleep(delay) => true,
                }
            }
            None => {
                time::sleep(delay).await;
                true
            }
        }
    }

    async fn attempt(
        &self,
        entries: &[MutationEntry],
        mut state: BatchAttemptState,
    ) -> BatchAttemptState {
        let batch_indices = state.begin_attempt();
        let attempt = state.attempts_made();
        self.metrics.record_mutate_attempt();
        if attempt > 1 {
            self.metrics
                .record_retried_entries(batch_indices.len() as u64);
        }

        let batch = batch_indices
            .iter()
            .map(|&index| entries[index].clone())
            .collect::<Vec<_>>();
        let batch_len = batch.len();
        let mut tally = AttemptTally::default();

        let drained = self.send_and_drain(batch, &batch_indices, &mut state, &mut tally);
        let result = match self.options.attempt_timeout {
            Some(limit) => match time::timeout(limit, drained).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("mutation batch rpc timed out after {limit:?}")),
            },
            None => drained.await,
        };

        if let Err(err) = result {
            warn!(attempt, error = %err, "mutation batch attempt failed");
            state.record_transport_error(format!("{err:#}"));
        }
        info!(
            attempt,
            batch_len,
            pending = state.pending().len(),
            succeeded = tally.succeeded,
            retryable = tally.retryable,
            terminal = tally.terminal,
            ignored = tally.ignored,
            "mutation attempt finished"
        );
        state
    }

    async fn send_and_drain(
        &self,
        batch: Vec<MutationEntry>,
        batch_indices: &[usize],
        state: &mut BatchAttemptState,
        tally: &mut AttemptTally,
    ) -> anyhow::Result<()> {
        let mut results = self.transport.send_mutation_batch(&self.table, batch).await?;
        while let Some(result) = results.next().await {
            let result = result?;
            let Some(&index) = batch_indices.get(result.index) else {
                warn!(
                    batch_index = result.index,
                    batch_len = batch_indices.len(),
                    "ignoring result for out-of-range batch index"
                );
                tally.ignored += 1;
                continue;
            };
            let code = result.status.code;
            match state.resolve(index, result.status) {
                Resolution::Succeeded => tally.succeeded += 1,
                Resolution::Retry => tally.retryable += 1,
                Resolution::Terminal => {
                    tally.terminal += 1;
                    self.metrics.record_terminal_failure();
                    debug!(index, code = %code, "entry failed with non-retryable status");
                }
                Resolution::Ignored => {
                    tally.ignored += 1;
                    warn!(index, code = %code, "ignoring result for already resolved entry");
                }
            }
        }
        Ok(())
    }
}
