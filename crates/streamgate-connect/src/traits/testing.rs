//! Testing utilities for connectors
//!
//! [`ScriptedConnector`] replays a fixed script of outcomes and records how
//! it was driven in a shared [`ConnectorProbe`]. [`MemorySink`] keeps every
//! forwarded record and can be told to start failing.
//!
//! # Example
//!
//! ```rust,ignore
//! use streamgate_connect::testing::*;
//!
//! let mut source = ScriptedConnector::new("scripted", "orders").with_records(3);
//! let probe = source.probe();
//! let sink = MemorySink::new();
//!
//! let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;
//! assert_eq!(outcome.records_forwarded, 3);
//! assert_eq!(probe.close_calls(), 1);
//! ```

use super::connector::{ConnectorState, InFlightCancel, Lifecycle, Produced, SourceConnector};
use super::sink::RecordSink;
use crate::error::{ConnectorError, ConnectorResult, SinkError};
use crate::record::{Cursor, Record};
use crate::shutdown::CancellationSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome of `produce_next()`
#[derive(Debug, Clone)]
pub enum Step {
    Record(Record),
    EndOfStream,
    Transient(String),
    Fatal(String),
    /// Sleep, then return the record (simulates a slow fetch)
    Delayed(Duration, Record),
    /// Wait for data that never comes, until the call is cancelled in flight
    Stall,
}

#[derive(Debug, Default)]
struct ProbeInner {
    connect_calls: AtomicU64,
    produce_calls: AtomicU64,
    produce_after_close: AtomicU64,
    close_calls: AtomicU64,
    in_flight_cancels: AtomicU64,
    handle_acquired: AtomicBool,
    closed: AtomicBool,
}

/// Shared view of how a [`ScriptedConnector`] was driven
#[derive(Debug, Clone, Default)]
pub struct ConnectorProbe {
    inner: Arc<ProbeInner>,
}

impl ConnectorProbe {
    pub fn connect_calls(&self) -> u64 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn produce_calls(&self) -> u64 {
        self.inner.produce_calls.load(Ordering::SeqCst)
    }

    /// `produce_next()` calls made after `close()`
    pub fn produce_after_close(&self) -> u64 {
        self.inner.produce_after_close.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u64 {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// Times the in-flight hook was fired
    pub fn in_flight_cancels(&self) -> u64 {
        self.inner.in_flight_cancels.load(Ordering::SeqCst)
    }

    /// Whether a connect ever succeeded in acquiring a (simulated) handle
    pub fn handle_acquired(&self) -> bool {
        self.inner.handle_acquired.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct ConnectorScript {
    steps: VecDeque<Step>,
    endless: bool,
}

/// A connector that replays a script.
///
/// Once the script runs out it returns `EndOfStream`, or keeps producing
/// numbered records when built with [`endless`](Self::endless).
#[derive(Debug)]
pub struct ScriptedConnector {
    name: String,
    topic: String,
    lifecycle: Lifecycle,
    script: ConnectorScript,
    sequence: u64,
    produced: u64,
    reject_connect: Option<String>,
    cancel_during_call: Option<(u64, CancellationSignal)>,
    wake: CancellationSignal,
    probe: ConnectorProbe,
}

/// Wakes a stalled [`ScriptedConnector`] call
struct ScriptedWake {
    wake: CancellationSignal,
    probe: ConnectorProbe,
}

#[async_trait]
impl InFlightCancel for ScriptedWake {
    async fn cancel_in_flight(&self) {
        self.probe
            .inner
            .in_flight_cancels
            .fetch_add(1, Ordering::SeqCst);
        self.wake.request();
    }
}

impl ScriptedConnector {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            lifecycle: Lifecycle::new(),
            script: ConnectorScript {
                steps: VecDeque::new(),
                endless: false,
            },
            sequence: 0,
            produced: 0,
            reject_connect: None,
            cancel_during_call: None,
            wake: CancellationSignal::new(),
            probe: ConnectorProbe::default(),
        }
    }

    /// Append `count` records with values `"0"`, `"1"`, ...
    pub fn with_records(mut self, count: u64) -> Self {
        for _ in 0..count {
            let record = self.numbered_record();
            self.script.steps.push_back(Step::Record(record));
        }
        self
    }

    /// Append `count` records of `size` bytes each
    pub fn with_sized_records(mut self, count: u64, size: usize) -> Self {
        for _ in 0..count {
            let record =
                Record::new(self.topic.clone(), vec![b'x'; size]).with_offset(self.sequence);
            self.sequence += 1;
            self.script.steps.push_back(Step::Record(record));
        }
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.script.steps.push_back(step);
        self
    }

    /// Keep producing numbered records after the script runs out
    pub fn endless(mut self) -> Self {
        self.script.endless = true;
        self
    }

    /// Fail `connect()` with `Auth`, as an expired token would
    pub fn reject_connect(mut self, message: impl Into<String>) -> Self {
        self.reject_connect = Some(message.into());
        self
    }

    /// Request cancellation while the given call (1-indexed) is in flight
    pub fn cancel_during_call(mut self, call: u64, signal: CancellationSignal) -> Self {
        self.cancel_during_call = Some((call, signal));
        self
    }

    pub fn probe(&self) -> ConnectorProbe {
        self.probe.clone()
    }

    fn numbered_record(&mut self) -> Record {
        let value = self.sequence.to_string();
        let record = Record::new(self.topic.clone(), value).with_offset(self.sequence);
        self.sequence += 1;
        record
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    fn cursor(&self) -> Option<Cursor> {
        Some(Cursor::from(self.produced))
    }

    fn in_flight_cancel(&self) -> Option<Arc<dyn InFlightCancel>> {
        let wake: Arc<dyn InFlightCancel> = Arc::new(ScriptedWake {
            wake: self.wake.clone(),
            probe: self.probe.clone(),
        });
        Some(wake)
    }

    async fn connect(&mut self) -> ConnectorResult<()> {
        self.probe.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.begin_connect()?;
        if let Some(message) = &self.reject_connect {
            self.lifecycle.fail_connect();
            return Err(ConnectorError::auth(message.clone()));
        }
        self.probe.inner.handle_acquired.store(true, Ordering::SeqCst);
        self.lifecycle.mark_connected();
        Ok(())
    }

    async fn produce_next(&mut self) -> ConnectorResult<Produced> {
        let call = self.probe.inner.produce_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.lifecycle.is_closed() {
            self.probe
                .inner
                .produce_after_close
                .fetch_add(1, Ordering::SeqCst);
        }
        self.lifecycle.begin_produce()?;

        if let Some((at, signal)) = &self.cancel_during_call {
            if *at == call {
                signal.request();
            }
        }

        let step = match self.script.steps.pop_front() {
            Some(step) => step,
            None if self.script.endless => Step::Record(self.numbered_record()),
            None => Step::EndOfStream,
        };

        match step {
            Step::Record(record) => {
                self.produced += 1;
                Ok(Produced::Record(record))
            }
            Step::Delayed(delay, record) => {
                tokio::time::sleep(delay).await;
                self.produced += 1;
                Ok(Produced::Record(record))
            }
            Step::Stall => {
                self.wake.cancelled().await;
                Err(ConnectorError::cancelled("stalled call woken by cancellation"))
            }
            Step::EndOfStream => Ok(Produced::EndOfStream),
            Step::Transient(message) => Err(ConnectorError::transient(message)),
            Step::Fatal(message) => Err(ConnectorError::fatal(message)),
        }
    }

    async fn close(&mut self) {
        self.probe.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.inner.closed.store(true, Ordering::SeqCst);
        self.lifecycle.close();
    }
}

/// A sink that stores forwarded records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    fail_after: Option<usize>,
    watched: Option<ConnectorProbe>,
    forwarded_after_close: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `count` records, then reject every further one
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Count forwards that arrive after the probed connector was closed
    pub fn watching(mut self, probe: ConnectorProbe) -> Self {
        self.watched = Some(probe);
        self
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Payloads as strings, in arrival order
    pub fn values(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| r.value_str().into_owned())
            .collect()
    }

    pub fn forwarded_after_close(&self) -> u64 {
        self.forwarded_after_close.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn forward(&self, record: Record) -> Result<(), SinkError> {
        if self.watched.as_ref().is_some_and(ConnectorProbe::is_closed) {
            self.forwarded_after_close.fetch_add(1, Ordering::SeqCst);
        }
        let mut records = self.records.lock();
        if self.fail_after.is_some_and(|limit| records.len() >= limit) {
            return Err(SinkError::new("memory", "sink is full"));
        }
        records.push(record);
        Ok(())
    }
}
