//! Caller-facing handle for one table.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use futures_util::TryStreamExt;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assembler::ReadStream;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::mutation::{MutateOptions, MutationBatcher};
use crate::planner::plan_read;
use crate::sample::{SampleKey, SampleKeyStream};
use crate::transport::DataTransport;
use crate::types::{AssembledRow, MutationEntry, MutationMethod, ReadSpec, RowFilter};

/// Handle for reading and mutating one table through a transport.
///
/// Cheap to clone; clones share the transport and metrics.
#[derive(Clone)]
pub struct Table {
    name: String,
    transport: Arc<dyn DataTransport>,
    config: ClientConfig,
    metrics: Arc<ClientMetrics>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn DataTransport>,
        config: ClientConfig,
    ) -> Self {
        Self::with_metrics(name, transport, config, Arc::new(ClientMetrics::new()))
    }

    pub fn with_metrics(
        name: impl Into<String>,
        transport: Arc<dyn DataTransport>,
        config: ClientConfig,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            config,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Default per-call options derived from the client configuration.
    pub fn mutate_options(&self) -> MutateOptions {
        MutateOptions::from_config(&self.config)
    }

    /// Apply `entries`, retrying transient per-entry failures.
    pub async fn mutate(&self, entries: &[MutationEntry], options: &MutateOptions) -> Result<()> {
        self.batcher(options).mutate(entries).await
    }

    pub async fn mutate_with_cancel(
        &self,
        entries: &[MutationEntry],
        options: &MutateOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.batcher(options)
            .mutate_with_cancel(entries, Some(cancel))
            .await
    }

    /// `mutate` with default options for entries that only write cells.
    pub async fn insert(&self, entries: &[MutationEntry]) -> Result<()> {
        if let Some(index) = entries
            .iter()
            .position(|entry| entry.method != MutationMethod::Insert)
        {
            return Err(ClientError::invalid(format!(
                "insert received non-insert entry at position {index}"
            )));
        }
        self.mutate(entries, &self.mutate_options()).await
    }

    /// Open a lazy row stream for `spec`.
    pub async fn create_read_stream(&self, spec: &ReadSpec) -> Result<ReadStream> {
        let mut request = plan_read(spec)?;
        request.app_profile_id = self.config.app_profile_id.clone();
        let rows_limit = request.rows_limit;
        let decode = request.decode;
        debug!(
            table = %self.name,
            keys = request.row_keys.len(),
            ranges = request.row_ranges.len(),
            rows_limit = ?rows_limit,
            "opening read stream"
        );

        let chunks = self
            .with_rpc_timeout("read", self.transport.send_read_request(&self.name, request))
            .await?;
        Ok(ReadStream::new(
            self.name.clone(),
            chunks,
            decode,
            rows_limit,
            self.metrics.clone(),
        ))
    }

    /// Collect every row selected by `spec`.
    pub async fn get_rows(&self, spec: &ReadSpec) -> Result<Vec<AssembledRow>> {
        self.create_read_stream(spec).await?.try_collect().await
    }

    /// Fetch a single row by key.
    pub async fn get_row(
        &self,
        key: impl Into<Bytes>,
        filter: Option<RowFilter>,
    ) -> Result<Option<AssembledRow>> {
        let mut spec = ReadSpec::new().key(key).limit(1);
        spec.filter = filter;
        let mut rows = self.get_rows(&spec).await?;
        Ok(rows.pop())
    }

    /// Whether the row has at least one cell; values are not transferred.
    pub async fn row_exists(&self, key: impl Into<Bytes>) -> Result<bool> {
        let filter = RowFilter::Chain(vec![RowFilter::CellsPerRowLimit(1), RowFilter::StripValue]);
        Ok(self.get_row(key, Some(filter)).await?.is_some())
    }

    pub async fn sample_row_keys(&self) -> Result<SampleKeyStream> {
        let records = self
            .with_rpc_timeout("sample keys", self.transport.send_sample_keys_request(&self.name))
            .await?;
        Ok(SampleKeyStream::new(records, self.metrics.clone()))
    }

    /// Collect the table's sample keys.
    pub async fn sample_keys(&self) -> Result<Vec<SampleKey>> {
        self.sample_row_keys().await?.try_collect().await
    }

    fn batcher(&self, options: &MutateOptions) -> MutationBatcher {
        MutationBatcher::new(
            self.transport.clone(),
            self.name.clone(),
            options.clone(),
            self.metrics.clone(),
        )
    }

    async fn with_rpc_timeout<T, F>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = match self.config.rpc_timeout {
            Some(limit) => match time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("{op} rpc timed out after {limit:?}")),
            },
            None => call.await,
        };
        result.map_err(ClientError::Transport)
    }
}
