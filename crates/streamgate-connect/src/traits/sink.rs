//! Downstream sink trait
//!
//! The run loop hands every produced record to a [`RecordSink`]. A sink
//! error always stops the loop: the record has already left the source,
//! so carrying on would drop it silently.

use crate::error::SinkError;
use crate::record::Record;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// Accepts records forwarded by the run loop
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Sink name used in logs and errors
    fn name(&self) -> &str;

    /// Forward a record downstream
    async fn forward(&self, record: Record) -> Result<(), SinkError>;

    /// Flush buffered output. Called once after the run loop exits.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that counts records and drops them
#[derive(Debug, Default)]
pub struct NullSink {
    records: AtomicU64,
    bytes: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn forward(&self, record: Record) -> Result<(), SinkError> {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(record.size_bytes() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Sink feeding a bounded channel into the local pipeline.
///
/// When the channel is full, `forward` waits for capacity; the time spent
/// waiting is accumulated as backpressure.
#[derive(Debug)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Record>,
    backpressure_events: AtomicU64,
    backpressure_wait_ns: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            name: name.into(),
            tx,
            backpressure_events: AtomicU64::new(0),
            backpressure_wait_ns: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Number of forwards that found the channel full
    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    /// Total time spent waiting for channel capacity
    pub fn backpressure_wait(&self) -> Duration {
        Duration::from_nanos(self.backpressure_wait_ns.load(Ordering::Relaxed))
    }

    fn closed(&self) -> SinkError {
        SinkError::new(&self.name, "downstream receiver dropped")
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, record: Record) -> Result<(), SinkError> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
            Err(TrySendError::Full(record)) => {
                let start = Instant::now();
                let result = self.tx.send(record).await.map_err(|_| self.closed());
                self.backpressure_events.fetch_add(1, Ordering::Relaxed);
                self.backpressure_wait_ns
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                result
            }
        }
    }
}
