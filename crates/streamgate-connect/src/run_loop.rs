//! Run loop - drives one source connector until it stops
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!   signal requested? ──yes──▶ Cancelled                │
//!            │ no                                       │
//!   rate limiter (optional)                             │
//!            │                                          │
//!     produce_next() ──Record──▶ sink.forward ─▶ meter ─┘
//!            │
//!            ├──EndOfStream──▶ Completed
//!            ├──Transient────▶ backoff (races the signal), retry
//!            └──other error──▶ Fatal
//!
//!   every exit: connector.close() exactly once, then sink.flush()
//! ```
//!
//! The loop never starts a produce call after it has seen the signal, but a
//! call already in flight is allowed to finish and its record is forwarded.
//! If the connector offers an [`InFlightCancel`] hook, a signal arriving
//! mid-call fires it, and a call that then ends with `Cancelled` stops the
//! loop as Cancelled. No record is forwarded after `close()`.
//!
//! Each iteration spends one unit of the task's cooperative budget, so an
//! always-ready source cannot starve the task that raises the signal.

use crate::error::{ConnectorError, ConnectorResult};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::record::Cursor;
use crate::shutdown::CancellationSignal;
use crate::throughput::ThroughputMeter;
use crate::traits::connector::{InFlightCancel, Produced, SourceConnector};
use crate::traits::retry::{RetryConfig, RetryGuard};
use crate::traits::sink::RecordSink;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Why a run loop stopped
#[derive(Debug)]
pub enum TerminationReason {
    /// The connector returned EndOfStream
    Completed,
    /// The cancellation signal was observed
    Cancelled,
    /// An unrecoverable error (including promoted transients and sink errors)
    Fatal(ConnectorError),
}

impl TerminationReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

/// Terminal result of a run loop
#[derive(Debug)]
pub struct RunOutcome {
    pub records_forwarded: u64,
    pub termination: TerminationReason,
    /// Connector cursor just before close, if the source has one
    pub cursor: Option<Cursor>,
}

impl RunOutcome {
    pub fn is_fatal(&self) -> bool {
        self.termination.is_fatal()
    }

    /// Forwarded count for Completed/Cancelled, the error for Fatal
    pub fn into_result(self) -> Result<u64, ConnectorError> {
        match self.termination {
            TerminationReason::Fatal(e) => Err(e),
            _ => Ok(self.records_forwarded),
        }
    }
}

/// Drives `produce_next()` on a borrowed connector
pub struct RunLoop<'a> {
    connector: &'a mut dyn SourceConnector,
    sink: &'a dyn RecordSink,
    signal: &'a CancellationSignal,
    meter: Option<&'a ThroughputMeter>,
    rate_limiter: Option<&'a TokenBucketRateLimiter>,
    retry: RetryConfig,
}

impl<'a> RunLoop<'a> {
    /// The connector must already be connected.
    pub fn new(
        connector: &'a mut dyn SourceConnector,
        sink: &'a dyn RecordSink,
        signal: &'a CancellationSignal,
    ) -> Self {
        Self {
            connector,
            sink,
            signal,
            meter: None,
            rate_limiter: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_meter(mut self, meter: &'a ThroughputMeter) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: &'a TokenBucketRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run until EndOfStream, cancellation or a fatal error, then close.
    pub async fn run(self) -> RunOutcome {
        let RunLoop {
            connector,
            sink,
            signal,
            meter,
            rate_limiter,
            retry,
        } = self;

        let name = connector.name().to_string();
        info!(
            source = %name,
            topic = connector.topic(),
            sink = sink.name(),
            "Run loop started"
        );

        let mut guard = RetryGuard::new(retry);
        let mut forwarded: u64 = 0;
        let hook = connector.in_flight_cancel();

        let mut termination = loop {
            if signal.is_requested() {
                break TerminationReason::Cancelled;
            }
            tokio::task::consume_budget().await;

            if let Some(limiter) = rate_limiter {
                let cancelled = tokio::select! {
                    biased;
                    _ = signal.cancelled() => true,
                    _ = limiter.acquire(1) => false,
                };
                if cancelled {
                    break TerminationReason::Cancelled;
                }
            }

            match produce(&mut *connector, hook.as_deref(), signal, &name).await {
                Ok(Produced::Record(record)) => {
                    guard.reset();
                    let bytes = record.size_bytes() as u64;
                    if let Err(e) = sink.forward(record).await {
                        error!(source = %name, "Sink rejected record: {}", e);
                        break TerminationReason::Fatal(e.into());
                    }
                    forwarded += 1;
                    if let Some(meter) = meter {
                        meter.record(bytes);
                    }
                }
                Ok(Produced::EndOfStream) => {
                    debug!(source = %name, "Source exhausted");
                    break TerminationReason::Completed;
                }
                Err(e) if e.is_cancelled() => {
                    debug!(source = %name, "In-flight call ended by cancellation: {}", e);
                    break TerminationReason::Cancelled;
                }
                Err(e) if e.is_transient() => match guard.record_failure() {
                    Some(delay) => {
                        warn!(
                            source = %name,
                            attempt = guard.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Transient error, retrying: {}",
                            e
                        );
                        let cancelled = tokio::select! {
                            biased;
                            _ = signal.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            break TerminationReason::Cancelled;
                        }
                    }
                    None => {
                        error!(
                            source = %name,
                            attempts = guard.attempt(),
                            "Giving up after repeated transient errors: {}",
                            e
                        );
                        break TerminationReason::Fatal(ConnectorError::retries_exhausted(
                            guard.attempt(),
                            e,
                        ));
                    }
                },
                Err(e) => {
                    error!(source = %name, "Fatal connector error: {}", e);
                    break TerminationReason::Fatal(e);
                }
            }
        };

        let cursor = connector.cursor();
        connector.close().await;

        if let Err(e) = sink.flush().await {
            error!(source = %name, "Sink flush failed: {}", e);
            if !termination.is_fatal() {
                termination = TerminationReason::Fatal(e.into());
            }
        }

        info!(
            source = %name,
            records = forwarded,
            cursor = cursor.as_ref().map(Cursor::as_str),
            "Run loop {}",
            termination
        );

        RunOutcome {
            records_forwarded: forwarded,
            termination,
            cursor,
        }
    }
}

/// One `produce_next()` call. When the signal arrives while the call is
/// pending, the hook is fired and the call is still awaited to its end.
async fn produce(
    connector: &mut dyn SourceConnector,
    hook: Option<&dyn InFlightCancel>,
    signal: &CancellationSignal,
    name: &str,
) -> ConnectorResult<Produced> {
    let Some(hook) = hook else {
        return connector.produce_next().await;
    };

    let call = connector.produce_next();
    tokio::pin!(call);
    tokio::select! {
        biased;
        result = &mut call => result,
        _ = signal.cancelled() => {
            debug!(source = %name, "Cancellation arrived mid-call, waking the source");
            hook.cancel_in_flight().await;
            call.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimitConfig;
    use crate::traits::connector::ConnectorState;
    use crate::traits::sink::NullSink;
    use crate::traits::testing::{MemorySink, ScriptedConnector, Step};
    use std::time::Duration;
    use tokio::time::Instant;

    fn request_after(signal: &CancellationSignal, delay: Duration) -> tokio::task::JoinHandle<()> {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            signal.request();
        })
    }

    async fn connected(source: ScriptedConnector) -> ScriptedConnector {
        let mut source = source;
        source.connect().await.unwrap();
        source
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::fixed_delay(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_completes_after_end_of_stream() {
        let mut source = connected(ScriptedConnector::new("s", "t").with_records(5)).await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

        assert!(matches!(outcome.termination, TerminationReason::Completed));
        assert_eq!(outcome.records_forwarded, 5);
        assert_eq!(sink.values(), vec!["0", "1", "2", "3", "4"]);
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(source.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_pre_requested_signal_produces_nothing() {
        let mut source = connected(ScriptedConnector::new("s", "t").endless()).await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();
        signal.request();

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
        assert_eq!(outcome.records_forwarded, 0);
        assert_eq!(probe.produce_calls(), 0);
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_still_closes() {
        let mut source = connected(
            ScriptedConnector::new("s", "t")
                .with_records(2)
                .with_step(Step::Fatal("schema mismatch".into())),
        )
        .await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

        assert_eq!(outcome.records_forwarded, 2);
        match outcome.termination {
            TerminationReason::Fatal(ConnectorError::Fatal(msg)) => {
                assert_eq!(msg, "schema mismatch")
            }
            other => panic!("unexpected termination: {other:?}"),
        }
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_sink_error_is_fatal() {
        let mut source = connected(ScriptedConnector::new("s", "t").with_records(10)).await;
        let probe = source.probe();
        let sink = MemorySink::new().fail_after(3);
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

        assert_eq!(outcome.records_forwarded, 3);
        assert!(matches!(
            outcome.termination,
            TerminationReason::Fatal(ConnectorError::Sink(_))
        ));
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(probe.produce_calls(), 4);
    }

    #[tokio::test]
    async fn test_transient_errors_within_cap_are_absorbed() {
        let mut source = connected(
            ScriptedConnector::new("s", "t")
                .with_records(1)
                .with_step(Step::Transient("read reset".into()))
                .with_step(Step::Transient("read reset".into()))
                .with_records(1),
        )
        .await;
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal)
            .with_retry(fast_retry(3))
            .run()
            .await;

        assert!(matches!(outcome.termination, TerminationReason::Completed));
        assert_eq!(sink.values(), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_retry_streak_resets_after_success() {
        let mut source = connected(
            ScriptedConnector::new("s", "t")
                .with_step(Step::Transient("a".into()))
                .with_records(1)
                .with_step(Step::Transient("b".into()))
                .with_records(1),
        )
        .await;
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal)
            .with_retry(fast_retry(2))
            .run()
            .await;

        assert!(matches!(outcome.termination, TerminationReason::Completed));
        assert_eq!(outcome.records_forwarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let mut source = connected(
            ScriptedConnector::new("s", "t").with_step(Step::Transient("blip".into())),
        )
        .await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let canceller = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                signal.request();
            })
        };

        let retry = RetryConfig::fixed_delay(5, Duration::from_secs(60));
        let outcome = RunLoop::new(&mut source, &sink, &signal)
            .with_retry(retry)
            .run()
            .await;
        canceller.await.unwrap();

        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
        assert_eq!(probe.produce_calls(), 1);
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_outcome_reports_cursor() {
        let mut source = connected(ScriptedConnector::new("s", "t").with_records(3)).await;
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;
        assert_eq!(outcome.cursor, Some(Cursor::from(3u64)));
        assert_eq!(outcome.into_result().unwrap(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_always_ready_source_does_not_starve_canceller() {
        let mut source = connected(ScriptedConnector::new("s", "t").endless()).await;
        let probe = source.probe();
        let sink = NullSink::new();
        let signal = CancellationSignal::new();
        let canceller = request_after(&signal, Duration::from_millis(10));

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            RunLoop::new(&mut source, &sink, &signal).run(),
        )
        .await
        .expect("run loop never observed the request");
        canceller.await.unwrap();

        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
        assert!(outcome.records_forwarded > 0);
        assert_eq!(outcome.records_forwarded, sink.records());
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_is_woken_by_cancellation() {
        let mut source = connected(
            ScriptedConnector::new("s", "t")
                .with_records(2)
                .with_step(Step::Stall),
        )
        .await;
        let probe = source.probe();
        let sink = MemorySink::new().watching(probe.clone());
        let signal = CancellationSignal::new();
        let canceller = request_after(&signal, Duration::from_millis(50));

        let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;
        canceller.await.unwrap();

        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
        assert_eq!(outcome.records_forwarded, 2);
        assert_eq!(probe.produce_calls(), 3);
        assert_eq!(probe.in_flight_cancels(), 1);
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(sink.forwarded_after_close(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_paces_produce_calls() {
        // 10/s with one extra token: 11 calls pass at once, the rest wait 100ms each
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::with_burst(10, 1));
        let mut source = connected(ScriptedConnector::new("s", "t").with_records(31)).await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();

        let started = Instant::now();
        let outcome = RunLoop::new(&mut source, &sink, &signal)
            .with_rate_limiter(&limiter)
            .run()
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome.termination, TerminationReason::Completed));
        assert_eq!(outcome.records_forwarded, 31);
        // 31 records plus the end-of-stream call
        assert_eq!(probe.produce_calls(), 32);
        assert!(elapsed >= Duration::from_millis(2000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2300), "{:?}", elapsed);
        assert!(limiter.stats().events_throttled > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_waiting_for_rate_limiter() {
        // capacity of two tokens, then one per second
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::with_burst(1, 1));
        let mut source = connected(ScriptedConnector::new("s", "t").endless()).await;
        let probe = source.probe();
        let sink = MemorySink::new();
        let signal = CancellationSignal::new();
        let canceller = request_after(&signal, Duration::from_millis(500));

        let started = Instant::now();
        let outcome = RunLoop::new(&mut source, &sink, &signal)
            .with_rate_limiter(&limiter)
            .run()
            .await;
        canceller.await.unwrap();

        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
        assert_eq!(outcome.records_forwarded, 2);
        assert_eq!(probe.produce_calls(), 2);
        assert_eq!(probe.close_calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
