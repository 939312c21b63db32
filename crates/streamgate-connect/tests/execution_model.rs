//! Execution model tests: connector → run loop → sink
//!
//! These tests drive whole pipelines and check the guarantees the runtime
//! gives across a deliberate shutdown:
//! 1. Completion delivers every record once, in order
//! 2. Cancellation lets at most the in-flight record through, then closes once,
//!    even when the source is always ready or parked on an idle topic
//! 3. Transient faults are retried up to the cap, then promoted to fatal
//! 4. Throughput windows are gapless
//! 5. Connection failures never enter the run loop
//!
//! Run with: cargo test -p streamgate-connect --test execution_model

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use streamgate_connect::config::{GlobalSettings, SourceConfig};
use streamgate_connect::connectors::{
    DatagenConfig, DatagenSource, WorkspaceSource, WorkspaceSourceConfig,
};
use streamgate_connect::source_runner::SourceRunner;
use streamgate_connect::testing::{MemorySink, ScriptedConnector, Step};
use streamgate_connect::workspace::{FetchGate, MemoryWorkspace};
use streamgate_connect::{
    CancellationSignal, ConnectorError, ConnectorResult, ConnectorSpec, ConnectorState,
    ConnectorStatus, NullSink, Record, RetryConfig, RunLoop, ShutdownCoordinator,
    SourceConnector, SourceFactory, SourceRegistry, TerminationReason, ThroughputMeter,
    WindowPolicy,
};

const TOKEN: &str = "sdk-token";

async fn connected(source: ScriptedConnector) -> ScriptedConnector {
    let mut source = source;
    source.connect().await.expect("scripted connect");
    source
}

fn workspace_records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new("orders", format!(r#"{{"id":{}}}"#, i)))
        .collect()
}

fn workspace_config(batch_size: usize) -> WorkspaceSourceConfig {
    let mut config = WorkspaceSourceConfig::new("12345", TOKEN, "http://localhost:9999");
    config.batch_size = batch_size;
    config
}

/// Builds workspace sources against an in-memory workspace
struct MemoryWorkspaceFactory {
    workspace: Arc<MemoryWorkspace>,
}

impl SourceFactory for MemoryWorkspaceFactory {
    fn spec(&self) -> ConnectorSpec {
        ConnectorSpec::new("workspace", "test")
    }

    fn create(
        &self,
        name: &str,
        topic: &str,
        config: &serde_yaml::Value,
    ) -> ConnectorResult<Box<dyn SourceConnector>> {
        let config: WorkspaceSourceConfig = serde_yaml::from_value(config.clone())?;
        Ok(Box::new(WorkspaceSource::new(
            name,
            topic,
            self.workspace.clone(),
            &config,
        )?))
    }
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_n_records_then_end_of_stream() -> Result<()> {
    let mut source = connected(ScriptedConnector::new("scripted", "orders").with_records(100)).await;
    let probe = source.probe();
    let sink = MemorySink::new().watching(probe.clone());
    let signal = CancellationSignal::new();

    let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

    assert!(matches!(outcome.termination, TerminationReason::Completed));
    assert_eq!(outcome.records_forwarded, 100);
    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    assert_eq!(sink.values(), expected);
    assert_eq!(probe.close_calls(), 1);
    assert_eq!(sink.forwarded_after_close(), 0);
    Ok(())
}

#[tokio::test]
async fn test_workspace_topic_end_to_end() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(50)));
    let mut source = WorkspaceSource::new("ws", "orders", workspace.clone(), &workspace_config(8))?;
    source.connect().await?;

    let sink = MemorySink::new();
    let signal = CancellationSignal::new();
    let meter = ThroughputMeter::new(WindowPolicy::Records(10))?;

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_meter(&meter)
        .run()
        .await;

    assert!(matches!(outcome.termination, TerminationReason::Completed));
    assert_eq!(outcome.records_forwarded, 50);
    assert_eq!(outcome.cursor.as_ref().map(|c| c.as_str()), Some("50"));
    let offsets: Vec<_> = sink.records().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..50).map(Some).collect::<Vec<_>>());

    assert_eq!(source.state(), ConnectorState::Closed);
    assert_eq!(workspace.open_handles(), 0);
    assert_eq!(meter.sealed_count(), 5);
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_during_call_forwards_at_most_one_more() -> Result<()> {
    let signal = CancellationSignal::new();
    let mut source = connected(
        ScriptedConnector::new("scripted", "orders")
            .endless()
            .cancel_during_call(3, signal.clone()),
    )
    .await;
    let probe = source.probe();
    let sink = MemorySink::new().watching(probe.clone());

    let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;

    assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    // calls 1 and 2 before the request, call 3 was in flight
    assert_eq!(outcome.records_forwarded, 3);
    assert_eq!(probe.produce_calls(), 3);
    assert_eq!(probe.close_calls(), 1);
    assert_eq!(probe.produce_after_close(), 0);
    assert_eq!(sink.forwarded_after_close(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_while_fetch_in_flight() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(10)));
    let gate = FetchGate::new();
    workspace.hold_fetches(gate.clone());

    let mut source = WorkspaceSource::new("ws", "orders", workspace.clone(), &workspace_config(1))?;
    source.connect().await?;

    let sink = Arc::new(MemorySink::new());
    let signal = CancellationSignal::new();

    let run = {
        let sink = sink.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            let outcome = RunLoop::new(&mut source, sink.as_ref(), &signal).run().await;
            (outcome, source)
        })
    };

    gate.wait_entered().await;
    signal.request();
    gate.open();

    let (outcome, source) = run.await?;
    assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    assert_eq!(outcome.records_forwarded, 1);
    assert_eq!(sink.values(), vec![r#"{"id":0}"#]);
    assert_eq!(source.state(), ConnectorState::Closed);
    assert_eq!(workspace.handles_released(), 1);
    assert_eq!(workspace.open_handles(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(3)));
    let mut source = WorkspaceSource::new("ws", "orders", workspace.clone(), &workspace_config(10))?;
    source.connect().await?;

    let sink = MemorySink::new();
    let signal = CancellationSignal::new();
    RunLoop::new(&mut source, &sink, &signal).run().await;

    // the run loop already closed it
    source.close().await;
    source.close().await;

    assert_eq!(source.state(), ConnectorState::Closed);
    assert_eq!(workspace.handles_issued(), 1);
    assert_eq!(workspace.handles_released(), 1);
    Ok(())
}

#[tokio::test]
async fn test_second_interrupt_is_absorbed() -> Result<()> {
    let coordinator = Arc::new(ShutdownCoordinator::new(CancellationSignal::new()));
    let signal = coordinator.signal().clone();

    let mut source = connected(
        ScriptedConnector::new("scripted", "orders")
            .endless()
            .with_step(Step::Delayed(Duration::from_millis(20), Record::new("orders", "slow"))),
    )
    .await;
    let probe = source.probe();
    let sink = Arc::new(MemorySink::new());

    let run = {
        let sink = sink.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            let outcome = RunLoop::new(&mut source, sink.as_ref(), &signal).run().await;
            (outcome, source)
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(coordinator.interrupt());
    assert!(!coordinator.interrupt());
    assert!(!coordinator.interrupt());

    let (outcome, _source) = run.await?;
    assert!(signal.is_requested());
    assert_eq!(coordinator.interrupts(), 3);
    assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    assert_eq!(outcome.records_forwarded, 1);
    assert_eq!(probe.close_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_wakes_idle_workspace_source() -> Result<()> {
    let workspace = Arc::new(MemoryWorkspace::new("12345", TOKEN).with_open_topic("orders"));
    let mut config = workspace_config(10);
    config.poll_interval_ms = 10;
    let mut source = WorkspaceSource::new("ws", "orders", workspace.clone(), &config)?;
    source.connect().await?;

    let sink = Arc::new(MemorySink::new());
    let signal = CancellationSignal::new();

    let run = {
        let sink = sink.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            let outcome = RunLoop::new(&mut source, sink.as_ref(), &signal).run().await;
            (outcome, source)
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    signal.request();

    let (outcome, source) = tokio::time::timeout(Duration::from_secs(3), run).await??;
    assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    assert_eq!(outcome.records_forwarded, 0);
    assert!(sink.is_empty());
    assert_eq!(source.state(), ConnectorState::Closed);
    assert_eq!(workspace.handles_released(), 1);
    assert_eq!(workspace.open_handles(), 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn test_unthrottled_datagen_yields_to_the_canceller() -> Result<()> {
    let config = DatagenConfig {
        events_per_second: 0,
        seed: Some(7),
        ..Default::default()
    };
    let mut source = DatagenSource::new("gen", "demo", config)?;
    source.connect().await?;

    let sink = NullSink::new();
    let signal = CancellationSignal::new();
    let canceller = {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.request();
        })
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        RunLoop::new(&mut source, &sink, &signal).run(),
    )
    .await?;
    canceller.await?;

    assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    assert!(outcome.records_forwarded > 0);
    assert_eq!(sink.records(), outcome.records_forwarded);
    assert_eq!(source.state(), ConnectorState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unthrottled_sources_on_every_worker_still_stop() -> Result<()> {
    let signal = CancellationSignal::new();
    let mut runs = Vec::new();
    for seed in 0..2 {
        let config = DatagenConfig {
            events_per_second: 0,
            seed: Some(seed),
            ..Default::default()
        };
        let mut source = DatagenSource::new(format!("gen-{seed}"), "demo", config)?;
        source.connect().await?;
        let signal = signal.clone();
        runs.push(tokio::spawn(async move {
            let sink = NullSink::new();
            RunLoop::new(&mut source, &sink, &signal).run().await
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    signal.request();

    for run in runs {
        let outcome = tokio::time::timeout(Duration::from_secs(5), run).await??;
        assert!(matches!(outcome.termination, TerminationReason::Cancelled));
    }
    Ok(())
}

// ============================================================================
// Transient faults
// ============================================================================

fn transient_script(transients: usize) -> ScriptedConnector {
    let mut source = ScriptedConnector::new("scripted", "orders").with_records(2);
    for _ in 0..transients {
        source = source.with_step(Step::Transient("read timed out".into()));
    }
    source.with_records(5)
}

#[tokio::test]
async fn test_transient_beyond_cap_is_promoted_after_close() -> Result<()> {
    // calls 3, 4 and 5 fail; the cap is three consecutive failures
    let mut source = connected(transient_script(3)).await;
    let probe = source.probe();
    let sink = MemorySink::new().watching(probe.clone());
    let signal = CancellationSignal::new();

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_retry(RetryConfig::fixed_delay(3, Duration::from_millis(1)))
        .run()
        .await;

    assert_eq!(outcome.records_forwarded, 2);
    assert_eq!(probe.produce_calls(), 5);
    assert_eq!(probe.close_calls(), 1);
    match outcome.termination {
        TerminationReason::Fatal(ConnectorError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("expected promoted transient, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_transients_on_calls_three_to_five_with_cap_of_five() -> Result<()> {
    // the cap counts consecutive failures, so call 6 succeeds inside it
    let mut source = connected(transient_script(3)).await;
    let probe = source.probe();
    let sink = MemorySink::new().watching(probe.clone());
    let signal = CancellationSignal::new();

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_retry(RetryConfig::fixed_delay(5, Duration::from_millis(1)))
        .run()
        .await;

    assert!(matches!(outcome.termination, TerminationReason::Completed));
    assert_eq!(outcome.records_forwarded, 7);
    assert_eq!(sink.values(), vec!["0", "1", "2", "3", "4", "5", "6"]);
    assert_eq!(probe.close_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_fault_persisting_through_call_seven_with_cap_of_five_is_promoted() -> Result<()> {
    // calls 3..=7 fail with a cap of five
    let mut source = connected(transient_script(5)).await;
    let probe = source.probe();
    let sink = MemorySink::new().watching(probe.clone());
    let signal = CancellationSignal::new();

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_retry(RetryConfig::fixed_delay(5, Duration::from_millis(1)))
        .run()
        .await;

    assert!(matches!(
        outcome.termination,
        TerminationReason::Fatal(ConnectorError::RetriesExhausted { attempts: 5, .. })
    ));
    assert_eq!(outcome.records_forwarded, 2);
    assert_eq!(probe.produce_calls(), 7);
    assert_eq!(probe.close_calls(), 1);
    assert_eq!(sink.forwarded_after_close(), 0);
    Ok(())
}

#[tokio::test]
async fn test_workspace_transient_fetch_faults_are_retried() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(4)));
    workspace.inject_fetch_faults([
        ConnectorError::transient("HTTP 503"),
        ConnectorError::transient("HTTP 503"),
    ]);
    let mut source = WorkspaceSource::new("ws", "orders", workspace.clone(), &workspace_config(2))?;
    source.connect().await?;

    let sink = MemorySink::new();
    let signal = CancellationSignal::new();
    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_retry(RetryConfig::fixed_delay(3, Duration::from_millis(1)))
        .run()
        .await;

    assert!(matches!(outcome.termination, TerminationReason::Completed));
    assert_eq!(outcome.records_forwarded, 4);
    assert_eq!(workspace.open_handles(), 0);
    Ok(())
}

// ============================================================================
// Throughput windows
// ============================================================================

#[tokio::test]
async fn test_thousand_records_in_hundred_record_windows() -> Result<()> {
    let mut source =
        connected(ScriptedConnector::new("scripted", "orders").with_sized_records(1000, 16)).await;
    let sink = MemorySink::new();
    let signal = CancellationSignal::new();
    let meter = ThroughputMeter::new(WindowPolicy::Records(100))?;

    let outcome = RunLoop::new(&mut source, &sink, &signal)
        .with_meter(&meter)
        .run()
        .await;
    assert_eq!(outcome.records_forwarded, 1000);

    let snapshot = meter.snapshot();
    assert_eq!(snapshot.sealed.len(), 10);
    assert!(snapshot.sealed.iter().all(|w| w.record_count == 100));
    assert!(snapshot.sealed.iter().all(|w| w.byte_count == 1600));
    assert_eq!(snapshot.current.record_count, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_periods_produce_gapless_zero_windows() -> Result<()> {
    let mut source = connected(
        ScriptedConnector::new("scripted", "orders")
            .with_step(Step::Delayed(Duration::from_millis(250), Record::new("orders", "a")))
            .with_step(Step::Delayed(Duration::from_millis(260), Record::new("orders", "b")))
            .with_step(Step::Delayed(Duration::from_millis(250), Record::new("orders", "c"))),
    )
    .await;
    let sink = MemorySink::new();
    let signal = CancellationSignal::new();
    let meter = ThroughputMeter::new(WindowPolicy::Duration(Duration::from_millis(100)))?;

    RunLoop::new(&mut source, &sink, &signal)
        .with_meter(&meter)
        .run()
        .await;

    let snapshot = meter.snapshot();
    let counts: Vec<u64> = snapshot.sealed.iter().map(|w| w.record_count).collect();
    assert_eq!(counts, vec![0, 0, 1, 0, 0, 1, 0]);
    assert_eq!(snapshot.current.record_count, 1);

    for (i, pair) in snapshot.sealed.windows(2).enumerate() {
        assert_eq!(pair[0].index, i as u64);
        assert_eq!(pair[1].index, i as u64 + 1);
        assert_eq!(
            pair[1].window_start - pair[0].window_start,
            chrono::Duration::milliseconds(100)
        );
    }
    assert_eq!(
        snapshot.current.window_start - snapshot.sealed[6].window_start,
        chrono::Duration::milliseconds(100)
    );
    Ok(())
}

// ============================================================================
// Connection failures
// ============================================================================

fn workspace_source_config(token: &str) -> SourceConfig {
    serde_yaml::from_str(&format!(
        r#"
connector: workspace
topic: orders
sink:
  type: "null"
config:
  workspace_id: "12345"
  token: {}
  portal_url: http://localhost:9999
"#,
        token
    ))
    .expect("valid source config")
}

fn memory_registry(workspace: Arc<MemoryWorkspace>) -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    registry.register("workspace", Arc::new(MemoryWorkspaceFactory { workspace }));
    Arc::new(registry)
}

#[tokio::test]
async fn test_expired_token_never_enters_loop() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(5)));
    let sink = Arc::new(MemorySink::new());
    let runner = SourceRunner::new(
        "orders",
        workspace_source_config("expired-token"),
        &GlobalSettings::default(),
        memory_registry(workspace.clone()),
    )?
    .with_sink(sink.clone());

    let err = runner
        .run(&CancellationSignal::new())
        .await
        .expect_err("connect must fail");

    assert!(err.is_auth());
    assert_eq!(runner.status(), ConnectorStatus::Failed);
    assert_eq!(workspace.handles_issued(), 0);
    assert_eq!(workspace.fetches(), 0);
    assert!(sink.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_runner_streams_workspace_topic() -> Result<()> {
    let workspace =
        Arc::new(MemoryWorkspace::new("12345", TOKEN).with_topic("orders", workspace_records(12)));
    let sink = Arc::new(MemorySink::new());
    let runner = SourceRunner::new(
        "orders",
        workspace_source_config(TOKEN),
        &GlobalSettings::default(),
        memory_registry(workspace.clone()),
    )?
    .with_sink(sink.clone());

    let outcome = runner.run(&CancellationSignal::new()).await?;

    assert_eq!(outcome.into_result()?, 12);
    assert_eq!(sink.len(), 12);
    assert_eq!(runner.status(), ConnectorStatus::Stopped);
    assert_eq!(workspace.open_handles(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_workspace_is_unavailable() -> Result<()> {
    let workspace = Arc::new(MemoryWorkspace::new("12345", TOKEN));
    workspace.set_reachable(false);
    let mut source =
        WorkspaceSource::new("ws", "orders", workspace.clone(), &workspace_config(10))?;

    let err = source.connect().await.expect_err("unreachable");
    assert!(matches!(err, ConnectorError::Unavailable(_)));
    source.close().await;
    assert_eq!(workspace.handles_issued(), 0);
    Ok(())
}
