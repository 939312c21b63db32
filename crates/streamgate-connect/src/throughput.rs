//! Throughput accounting
//!
//! A [`ThroughputMeter`] keeps a gapless, ordered sequence of sealed
//! windows plus one open window. It is a side channel: the run loop calls
//! [`ThroughputMeter::record`] after forwarding a record and never reads
//! anything back, so a slow reader can not stall delivery.
//!
//! ```text
//!  index:    0        1        2        3        4
//!          ┌────────┬────────┬────────┬────────┬────────┐
//!  records │   1    │   0    │   0    │   1    │  ...   │
//!          └────────┴────────┴────────┴────────┴────────┘
//!            sealed   sealed   sealed   sealed    open
//! ```
//!
//! Windows are either fixed durations (elapsed windows are sealed even when
//! empty) or fixed record counts.

use crate::error::{ConnectorError, ConnectorResult};
use crate::shutdown::CancellationSignal;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Minimum length of a time window
pub const MIN_WINDOW: Duration = Duration::from_millis(1);

/// How windows are delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Seal a window every time this much time has elapsed
    Duration(Duration),
    /// Seal a window once it holds this many records
    Records(u64),
}

impl WindowPolicy {
    pub fn validate(&self) -> ConnectorResult<()> {
        match self {
            Self::Duration(d) if *d < MIN_WINDOW => Err(ConnectorError::config(format!(
                "throughput window must be at least {:?}, got {:?}",
                MIN_WINDOW, d
            ))),
            Self::Records(0) => Err(ConnectorError::config(
                "throughput window must hold at least one record",
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for WindowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duration(d) => write!(f, "{}ms windows", d.as_millis()),
            Self::Records(n) => write!(f, "{}-record windows", n),
        }
    }
}

/// Counts for one window. Immutable once sealed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputSample {
    /// Position in the window sequence, starting at 0
    pub index: u64,
    pub window_start: DateTime<Utc>,
    pub record_count: u64,
    pub byte_count: u64,
    /// Window length (time elapsed so far for the open window)
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ThroughputSample {
    pub fn records_per_sec(&self) -> f64 {
        rate(self.record_count, self.duration)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        rate(self.byte_count, self.duration)
    }
}

/// Read-only copy of the meter's windows
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    pub sealed: Vec<ThroughputSample>,
    /// The open window at the time of the snapshot
    pub current: ThroughputSample,
}

/// Aggregate view over everything the meter has seen
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSummary {
    pub total_records: u64,
    pub total_bytes: u64,
    pub sealed_windows: usize,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub mean_records_per_sec: f64,
    pub mean_bytes_per_sec: f64,
    /// Best sealed window; zero until a window has been sealed
    pub peak_records_per_sec: f64,
}

impl std::fmt::Display for ThroughputSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records / {} bytes in {:.2}s over {} windows (mean {:.0} rec/s, peak {:.0} rec/s)",
            self.total_records,
            self.total_bytes,
            self.elapsed.as_secs_f64(),
            self.sealed_windows,
            self.mean_records_per_sec,
            self.peak_records_per_sec
        )
    }
}

#[derive(Debug)]
struct OpenWindow {
    index: u64,
    started: Instant,
    records: u64,
    bytes: u64,
}

#[derive(Debug)]
struct MeterState {
    sealed: Vec<ThroughputSample>,
    open: OpenWindow,
    total_records: u64,
    total_bytes: u64,
}

/// Windowed record/byte counter
#[derive(Debug)]
pub struct ThroughputMeter {
    policy: WindowPolicy,
    origin: Instant,
    origin_wall: DateTime<Utc>,
    state: Mutex<MeterState>,
}

impl ThroughputMeter {
    pub fn new(policy: WindowPolicy) -> ConnectorResult<Self> {
        Self::with_origin(policy, Instant::now())
    }

    /// Start the first window at `origin` instead of now
    pub fn with_origin(policy: WindowPolicy, origin: Instant) -> ConnectorResult<Self> {
        policy.validate()?;
        let origin_wall = Utc::now() - chrono_duration(Instant::now().saturating_duration_since(origin));
        Ok(Self {
            policy,
            origin,
            origin_wall,
            state: Mutex::new(MeterState {
                sealed: Vec::new(),
                open: OpenWindow {
                    index: 0,
                    started: origin,
                    records: 0,
                    bytes: 0,
                },
                total_records: 0,
                total_bytes: 0,
            }),
        })
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Count one forwarded record of `bytes` bytes
    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Count one record observed at `now`.
    ///
    /// Every window that ended before `now` is sealed first, so the record
    /// always lands in the window active at `now`.
    pub fn record_at(&self, now: Instant, bytes: u64) {
        let mut state = self.state.lock();
        self.seal_elapsed(&mut state, now);

        state.open.records += 1;
        state.open.bytes += bytes;
        state.total_records += 1;
        state.total_bytes += bytes;

        if let WindowPolicy::Records(limit) = self.policy {
            if state.open.records >= limit {
                self.seal_open(&mut state, now);
            }
        }
    }

    /// Seal windows that have elapsed without new records
    pub fn advance(&self) {
        self.advance_to(Instant::now());
    }

    pub fn advance_to(&self, now: Instant) {
        let mut state = self.state.lock();
        self.seal_elapsed(&mut state, now);
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        ThroughputSnapshot {
            sealed: state.sealed.clone(),
            current: self.sample_of(&state.open, now.saturating_duration_since(state.open.started)),
        }
    }

    /// Sealed windows with `index >= from`, in order
    pub fn sealed_since(&self, from: u64) -> Vec<ThroughputSample> {
        let state = self.state.lock();
        // Indices are dense and start at 0, so the index is the position.
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        state.sealed.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn sealed_count(&self) -> usize {
        self.state.lock().sealed.len()
    }

    pub fn summary(&self) -> ThroughputSummary {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        let state = self.state.lock();
        let peak = state
            .sealed
            .iter()
            .map(ThroughputSample::records_per_sec)
            .fold(0.0_f64, f64::max);
        ThroughputSummary {
            total_records: state.total_records,
            total_bytes: state.total_bytes,
            sealed_windows: state.sealed.len(),
            elapsed,
            mean_records_per_sec: rate(state.total_records, elapsed),
            mean_bytes_per_sec: rate(state.total_bytes, elapsed),
            peak_records_per_sec: peak,
        }
    }

    fn seal_elapsed(&self, state: &mut MeterState, now: Instant) {
        let WindowPolicy::Duration(length) = self.policy else {
            return;
        };
        while now.saturating_duration_since(state.open.started) >= length {
            let end = state.open.started + length;
            self.seal_open(state, end);
        }
    }

    fn seal_open(&self, state: &mut MeterState, end: Instant) {
        let duration = end.saturating_duration_since(state.open.started);
        let sample = self.sample_of(&state.open, duration);
        debug!(
            window = sample.index,
            records = sample.record_count,
            bytes = sample.byte_count,
            "Sealed throughput window"
        );
        state.sealed.push(sample);
        state.open = OpenWindow {
            index: state.open.index + 1,
            started: end,
            records: 0,
            bytes: 0,
        };
    }

    fn sample_of(&self, window: &OpenWindow, duration: Duration) -> ThroughputSample {
        let offset = window.started.saturating_duration_since(self.origin);
        ThroughputSample {
            index: window.index,
            window_start: self.origin_wall + chrono_duration(offset),
            record_count: window.records,
            byte_count: window.bytes,
            duration,
        }
    }
}

/// Periodically seals idle windows and logs every newly sealed one
pub struct ThroughputReporter;

impl ThroughputReporter {
    /// Spawn the reporter. It exits after a final report once `signal`
    /// is requested.
    pub fn spawn(
        meter: Arc<ThroughputMeter>,
        interval: Duration,
        signal: CancellationSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_WINDOW));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut next = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        meter.advance();
                        next = report_since(&meter, next);
                    }
                    _ = signal.cancelled() => {
                        meter.advance();
                        report_since(&meter, next);
                        return;
                    }
                }
            }
        })
    }
}

fn report_since(meter: &ThroughputMeter, from: u64) -> u64 {
    let mut next = from;
    for sample in meter.sealed_since(from) {
        info!(
            window = sample.index,
            start = %sample.window_start.format("%H:%M:%S%.3f"),
            records = sample.record_count,
            bytes = sample.byte_count,
            "Throughput: {:.0} rec/s, {:.1} KiB/s",
            sample.records_per_sec(),
            sample.bytes_per_sec() / 1024.0
        );
        next = sample.index + 1;
    }
    next
}

fn rate(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }
}
