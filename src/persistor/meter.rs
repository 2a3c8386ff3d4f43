//! Byte metering and single-pass MD5 hashing for streams in flight.
//!
//! [`StreamMeter`] is fed chunk by chunk by whoever owns the transfer loop;
//! [`metered`] wraps an [`ObjectStream`] handed to a caller. Either way the
//! byte count is reported exactly once, and a transfer that fails or is
//! dropped half-way still reports what it moved.

use crate::models::ContentDigest;
use crate::persistor::ObjectStream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use opentelemetry::{KeyValue, global, metrics::Counter};
use serde::Serialize;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From a backend to us.
    Ingress,
    /// From us to a backend.
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferTotal {
    pub backend: String,
    pub direction: Direction,
    pub bytes: u64,
}

/// Transfer byte counters tagged by backend and direction.
///
/// Every recording goes to the OpenTelemetry counter
/// `filestore_transfer_bytes`; running totals are also kept in-process so the
/// service can report them without an exporter.
#[derive(Clone)]
pub struct TransferMetrics {
    counter: Counter<u64>,
    totals: Arc<Mutex<HashMap<(String, Direction), u64>>>,
}

impl TransferMetrics {
    pub fn new() -> Self {
        let counter = global::meter("filestore")
            .u64_counter("filestore_transfer_bytes")
            .with_description("Bytes moved between the filestore and its storage backends")
            .build();
        Self {
            counter,
            totals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record(&self, backend: &str, direction: Direction, bytes: u64) {
        self.counter.add(
            bytes,
            &[
                KeyValue::new("backend", backend.to_string()),
                KeyValue::new("direction", direction.as_str()),
            ],
        );
        let mut totals = self.totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *totals.entry((backend.to_string(), direction)).or_default() += bytes;
    }

    #[cfg(test)]
    pub fn total(&self, backend: &str, direction: Direction) -> u64 {
        let totals = self.totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        totals
            .get(&(backend.to_string(), direction))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<TransferTotal> {
        let totals = self.totals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot: Vec<TransferTotal> = totals
            .iter()
            .map(|((backend, direction), bytes)| TransferTotal {
                backend: backend.clone(),
                direction: *direction,
                bytes: *bytes,
            })
            .collect();
        snapshot.sort_by(|a, b| {
            (a.backend.as_str(), a.direction.as_str()).cmp(&(b.backend.as_str(), b.direction.as_str()))
        });
        snapshot
    }
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts (and optionally hashes) the bytes of one transfer.
pub struct StreamMeter {
    metrics: TransferMetrics,
    backend: &'static str,
    direction: Direction,
    bytes: u64,
    hasher: Option<md5::Context>,
    recorded: bool,
}

impl StreamMeter {
    pub fn new(metrics: TransferMetrics, backend: &'static str, direction: Direction) -> Self {
        Self {
            metrics,
            backend,
            direction,
            bytes: 0,
            hasher: None,
            recorded: false,
        }
    }

    /// Also compute an MD5 digest of everything observed.
    pub fn hashing(mut self) -> Self {
        self.hasher = Some(md5::Context::new());
        self
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.consume(chunk);
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Report the byte count and return the digest of what was observed.
    ///
    /// A meter built without [`hashing`](Self::hashing) returns the digest
    /// of the empty payload.
    pub fn finish(mut self) -> ContentDigest {
        self.report();
        self.hasher
            .take()
            .unwrap_or_else(md5::Context::new)
            .compute()
            .into()
    }

    fn report(&mut self) {
        if !self.recorded {
            self.recorded = true;
            self.metrics.record(self.backend, self.direction, self.bytes);
        }
    }
}

impl Drop for StreamMeter {
    fn drop(&mut self) {
        self.report();
    }
}

struct MeteredStream {
    inner: ObjectStream,
    meter: Option<StreamMeter>,
}

impl Stream for MeteredStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(meter) = this.meter.as_mut() {
                    meter.observe(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // the meter reports whatever it saw when dropped
                this.meter.take();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.meter.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap a stream so its bytes are counted as they are consumed.
pub fn metered(inner: ObjectStream, meter: StreamMeter) -> ObjectStream {
    MeteredStream {
        inner,
        meter: Some(meter),
    }
    .boxed()
}

/// Drain a stream, returning the MD5 of its content.
pub async fn calculate_stream_md5(mut stream: ObjectStream) -> io::Result<ContentDigest> {
    let mut hasher = md5::Context::new();
    while let Some(chunk) = stream.next().await {
        hasher.consume(&chunk?);
    }
    Ok(hasher.compute().into())
}
