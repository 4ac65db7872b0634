//! Sampled split points of a table.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;

use crate::error::{ClientError, ProtocolError};
use crate::metrics::ClientMetrics;
use crate::transport;

/// Raw record as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleKeyRecord {
    pub row_key: Bytes,
    pub offset_bytes: i64,
}

impl SampleKeyRecord {
    pub fn new(row_key: impl Into<Bytes>, offset_bytes: i64) -> Self {
        Self {
            row_key: row_key.into(),
            offset_bytes,
        }
    }
}

/// Approximate split point: `offset` is the approximate byte position of
/// `key` within the table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SampleKey {
    #[serde(serialize_with = "serialize_hex")]
    pub key: Bytes,
    pub offset: u64,
}

fn serialize_hex<S>(key: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(key))
}

impl TryFrom<SampleKeyRecord> for SampleKey {
    type Error = ProtocolError;

    fn try_from(record: SampleKeyRecord) -> Result<Self, Self::Error> {
        let offset = u64::try_from(record.offset_bytes).map_err(|_| {
            ProtocolError::NegativeSampleOffset {
                offset: record.offset_bytes,
            }
        })?;
        Ok(Self {
            key: record.row_key,
            offset,
        })
    }
}

/// Stream of sample keys in transport order.
///
/// The first error ends the stream.
pub struct SampleKeyStream {
    records: Option<transport::SampleKeyRecordStream>,
    metrics: Arc<ClientMetrics>,
}

impl SampleKeyStream {
    pub(crate) fn new(
        records: transport::SampleKeyRecordStream,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            records: Some(records),
            metrics,
        }
    }
}

impl Stream for SampleKeyStream {
    type Item = Result<SampleKey, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(records) = this.records.as_mut() else {
            return Poll::Ready(None);
        };
        let item = ready!(records.as_mut().poll_next(cx));
        let result = match item {
            None => {
                this.records = None;
                return Poll::Ready(None);
            }
            Some(Err(err)) => Err(ClientError::Transport(err)),
            Some(Ok(record)) => SampleKey::try_from(record).map_err(|err| {
                this.metrics.record_protocol_error();
                ClientError::Protocol(err)
            }),
        };
        match &result {
            Ok(_) => this.metrics.record_sample_key(),
            Err(_) => this.records = None,
        }
        Poll::Ready(Some(result))
    }
}
