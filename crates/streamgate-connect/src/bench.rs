//! Throughput harness
//!
//! Drives a datagen source through a bounded channel into a consumer task
//! until the source runs dry, the duration elapses or the operator
//! interrupts:
//!
//! ```text
//!   DatagenSource ─▶ RunLoop ─▶ ChannelSink ══(bounded)══▶ consumer
//!                      │
//!                      └─▶ ThroughputMeter ─▶ ThroughputReporter (logs)
//! ```
//!
//! A slow consumer fills the channel; the time the producer spends waiting
//! for capacity shows up as backpressure in the report.

use crate::connectors::datagen::{DataPattern, DatagenConfig, DatagenSource};
use crate::error::{ConnectorError, ConnectorResult};
use crate::run_loop::{RunLoop, TerminationReason};
use crate::shutdown::ShutdownCoordinator;
use crate::throughput::{ThroughputMeter, ThroughputReporter, ThroughputSummary, WindowPolicy};
use crate::traits::connector::SourceConnector;
use crate::traits::retry::RetryConfig;
use crate::traits::sink::ChannelSink;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Harness parameters
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub pattern: DataPattern,
    /// 0 = as fast as possible
    pub events_per_second: u32,
    /// 0 = until cancelled
    pub max_events: u64,
    /// Stop after this long
    pub duration: Option<Duration>,
    pub channel_capacity: usize,
    pub window: WindowPolicy,
    pub report_interval: Duration,
    /// Artificial per-record delay in the consumer
    pub consumer_delay: Option<Duration>,
    pub seed: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            pattern: DataPattern::Sequence,
            events_per_second: 0,
            max_events: 0,
            duration: None,
            channel_capacity: 1024,
            window: WindowPolicy::Duration(Duration::from_secs(1)),
            report_interval: Duration::from_secs(1),
            consumer_delay: None,
            seed: None,
        }
    }
}

/// What a harness run measured
#[derive(Debug)]
pub struct BenchReport {
    pub produced: u64,
    pub consumed: u64,
    pub termination: TerminationReason,
    pub throughput: ThroughputSummary,
    pub backpressure_events: u64,
    pub backpressure_wait: Duration,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Benchmark {}", self.termination)?;
        writeln!(f, "  produced:      {}", self.produced)?;
        writeln!(f, "  consumed:      {}", self.consumed)?;
        writeln!(f, "  {}", self.throughput)?;
        write!(
            f,
            "  backpressure:  {} waits, {:.3}s total",
            self.backpressure_events,
            self.backpressure_wait.as_secs_f64()
        )
    }
}

/// Run the harness until the source ends or the coordinator's signal is requested
pub async fn run_bench(
    config: BenchConfig,
    coordinator: Arc<ShutdownCoordinator>,
) -> ConnectorResult<BenchReport> {
    let signal = coordinator.signal().clone();

    let mut source = DatagenSource::new(
        "bench",
        "bench",
        DatagenConfig {
            pattern: config.pattern,
            events_per_second: config.events_per_second,
            max_events: config.max_events,
            seed: config.seed,
            ..Default::default()
        },
    )?;
    source.connect().await?;

    let meter = Arc::new(ThroughputMeter::new(config.window)?);
    let (sink, mut rx) = ChannelSink::new("bench-channel", config.channel_capacity);

    let consumer_delay = config.consumer_delay;
    let consumer = tokio::spawn(async move {
        let mut consumed = 0u64;
        while rx.recv().await.is_some() {
            consumed += 1;
            if let Some(delay) = consumer_delay {
                tokio::time::sleep(delay).await;
            }
        }
        consumed
    });

    let reporter = ThroughputReporter::spawn(meter.clone(), config.report_interval, signal.clone());

    let timer = config.duration.map(|duration| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    coordinator.request("benchmark duration elapsed");
                }
                _ = coordinator.signal().cancelled() => {}
            }
        })
    });

    info!(
        pattern = %config.pattern,
        rate = config.events_per_second,
        max_events = config.max_events,
        capacity = config.channel_capacity,
        "Benchmark started ({})",
        config.window
    );

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_meter(&meter)
        .with_retry(RetryConfig::no_retry())
        .run()
        .await;

    let backpressure_events = sink.backpressure_events();
    let backpressure_wait = sink.backpressure_wait();
    // closing the channel lets the consumer drain and finish
    drop(sink);
    let consumed = consumer
        .await
        .map_err(|e| ConnectorError::fatal(format!("consumer task failed: {}", e)))?;
    debug!(consumed, "Consumer drained");

    coordinator.request("benchmark finished");
    if let Some(timer) = timer {
        timer.abort();
    }
    if let Err(e) = reporter.await {
        debug!("Throughput reporter ended abnormally: {}", e);
    }

    meter.advance();
    Ok(BenchReport {
        produced: outcome.records_forwarded,
        consumed,
        termination: outcome.termination,
        throughput: meter.summary(),
        backpressure_events,
        backpressure_wait,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::CancellationSignal;

    fn coordinator() -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::new(CancellationSignal::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_run_completes() {
        let config = BenchConfig {
            max_events: 1000,
            window: WindowPolicy::Records(100),
            seed: Some(7),
            ..Default::default()
        };

        let report = run_bench(config, coordinator()).await.unwrap();

        assert!(matches!(report.termination, TerminationReason::Completed));
        assert_eq!(report.produced, 1000);
        assert_eq!(report.consumed, 1000);
        assert_eq!(report.throughput.total_records, 1000);
        assert_eq!(report.throughput.sealed_windows, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_cancels_run() {
        let config = BenchConfig {
            events_per_second: 100,
            duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        let coordinator = coordinator();
        let report = run_bench(config, coordinator.clone()).await.unwrap();

        assert!(matches!(report.termination, TerminationReason::Cancelled));
        assert!(report.produced >= 99 && report.produced <= 101);
        assert_eq!(report.consumed, report.produced);
        assert_eq!(coordinator.interrupts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_causes_backpressure() {
        let config = BenchConfig {
            max_events: 20,
            channel_capacity: 1,
            consumer_delay: Some(Duration::from_millis(5)),
            ..Default::default()
        };

        let report = run_bench(config, coordinator()).await.unwrap();

        assert_eq!(report.consumed, 20);
        assert!(report.backpressure_events > 0);
        assert!(report.backpressure_wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_interrupt_stops_unbounded_run() {
        let coordinator = coordinator();
        let interrupter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                coordinator.interrupt();
                coordinator.interrupt();
            })
        };

        let report = run_bench(BenchConfig::default(), coordinator.clone())
            .await
            .unwrap();
        interrupter.await.unwrap();

        assert!(matches!(report.termination, TerminationReason::Cancelled));
        assert_eq!(report.consumed, report.produced);
        assert_eq!(coordinator.interrupts(), 2);
    }

    #[test]
    fn test_report_display() {
        let report = BenchReport {
            produced: 10,
            consumed: 10,
            termination: TerminationReason::Completed,
            throughput: ThroughputMeter::new(WindowPolicy::Records(5)).unwrap().summary(),
            backpressure_events: 0,
            backpressure_wait: Duration::ZERO,
        };
        let text = report.to_string();
        assert!(text.starts_with("Benchmark completed"));
        assert!(text.contains("produced:      10"));
    }
}
