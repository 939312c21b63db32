//! streamgate-connect - run workspace sources and the throughput harness
//!
//! # Usage
//!
//! ```bash
//! # Run all enabled sources (Ctrl+C stops them gracefully)
//! streamgate-connect -c streamgate.yaml
//!
//! # Throughput harness for 30 seconds with a slow consumer
//! streamgate-connect bench --duration-secs 30 --consumer-delay-us 50
//!
//! # Validate configuration
//! streamgate-connect -c streamgate.yaml validate
//!
//! # Inspect connectors
//! streamgate-connect connectors
//! streamgate-connect schema workspace --format yaml
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use streamgate_connect::bench::{run_bench, BenchConfig};
use streamgate_connect::config::ConnectConfig;
use streamgate_connect::connectors::{create_source_registry, DataPattern};
use streamgate_connect::source_runner::SourceRunner;
use streamgate_connect::{
    CancellationSignal, ShutdownCoordinator, TerminationReason, ThroughputReporter, WindowPolicy,
};

#[derive(Parser)]
#[command(name = "streamgate-connect")]
#[command(version, about = "Cancellable source connectors for remote workspaces")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "streamgate.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all enabled sources (default)
    Run,
    /// Measure throughput of a synthetic source through a bounded channel
    Bench(BenchArgs),
    /// Validate configuration file
    Validate,
    /// List available connector types
    Connectors,
    /// Show config schema for a connector type
    Schema {
        /// Connector type (e.g., workspace, datagen)
        connector: String,
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Args)]
struct BenchArgs {
    /// Data pattern (sequence, random, users, orders, events, metrics, key_value)
    #[arg(long, default_value = "sequence")]
    pattern: String,

    /// Records per second (0 = unthrottled)
    #[arg(long, default_value_t = 0)]
    events_per_second: u32,

    /// Stop after this many records (0 = until cancelled)
    #[arg(long, default_value_t = 0)]
    max_events: u64,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Channel capacity between producer and consumer
    #[arg(long, default_value_t = 1024)]
    capacity: usize,

    /// Time window length in milliseconds
    #[arg(long, default_value_t = 1000)]
    window_ms: u64,

    /// Count-based windows instead of time windows
    #[arg(long)]
    window_records: Option<u64>,

    /// How often sealed windows are logged, in milliseconds
    #[arg(long, default_value_t = 1000)]
    report_interval_ms: u64,

    /// Artificial per-record consumer delay in microseconds
    #[arg(long)]
    consumer_delay_us: Option<u64>,

    /// Seed for reproducible data
    #[arg(long)]
    seed: Option<u64>,
}

impl BenchArgs {
    fn into_config(self) -> Result<BenchConfig> {
        let pattern: DataPattern = serde_yaml::from_str(&self.pattern)
            .with_context(|| format!("Unknown data pattern '{}'", self.pattern))?;
        let window = match self.window_records {
            Some(n) => WindowPolicy::Records(n),
            None => WindowPolicy::Duration(Duration::from_millis(self.window_ms)),
        };
        window.validate()?;

        Ok(BenchConfig {
            pattern,
            events_per_second: self.events_per_second,
            max_events: self.max_events,
            duration: self.duration_secs.map(Duration::from_secs),
            channel_capacity: self.capacity,
            window,
            report_interval: Duration::from_millis(self.report_interval_ms),
            consumer_delay: self.consumer_delay_us.map(Duration::from_micros),
            seed: self.seed,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't need config
    let command = cli.command.unwrap_or(Commands::Run);
    let command = match command {
        Commands::Connectors => {
            init_logging(cli.verbose, "info");
            return list_connectors();
        }
        Commands::Schema { connector, format } => {
            init_logging(cli.verbose, "info");
            return show_schema(&connector, &format);
        }
        Commands::Bench(args) => {
            init_logging(cli.verbose, "info");
            return bench(args).await;
        }
        other => other,
    };

    let config = ConnectConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    init_logging(cli.verbose, &config.settings.log_level);

    match command {
        Commands::Validate => validate_config(&config),
        _ => run_all(config).await,
    }
}

fn init_logging(verbose: bool, default_level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run_all(config: ConnectConfig) -> Result<()> {
    info!("Starting streamgate-connect");

    let signal = CancellationSignal::new();
    let coordinator = Arc::new(ShutdownCoordinator::new(signal.clone()));
    coordinator.clone().listen();

    let registry = Arc::new(create_source_registry());
    let settings = &config.settings;

    let mut tasks = Vec::new();
    let mut reporters = Vec::new();
    let mut runners = Vec::new();

    for (name, source_config) in config.enabled_sources() {
        let runner = Arc::new(
            SourceRunner::new(name.clone(), source_config.clone(), settings, registry.clone())
                .with_context(|| format!("Failed to set up source '{}'", name))?,
        );
        info!(
            "Source '{}': {} → topic '{}'",
            name, source_config.connector, source_config.topic
        );

        reporters.push(ThroughputReporter::spawn(
            runner.meter(),
            settings.throughput.report_interval(),
            signal.clone(),
        ));

        let task_runner = runner.clone();
        let task_signal = signal.clone();
        tasks.push(tokio::spawn(async move {
            task_runner.run(&task_signal).await
        }));
        runners.push(runner);
    }

    if tasks.is_empty() {
        warn!("No enabled sources configured");
        return Ok(());
    }

    let all = futures::future::join_all(tasks);
    tokio::pin!(all);

    let results = tokio::select! {
        results = &mut all => results,
        _ = signal.cancelled() => {
            info!(
                "Waiting up to {}ms for sources to stop",
                settings.shutdown_timeout_ms
            );
            match tokio::time::timeout(settings.shutdown_timeout(), &mut all).await {
                Ok(results) => results,
                Err(_) => {
                    anyhow::bail!(
                        "Sources did not stop within {}ms",
                        settings.shutdown_timeout_ms
                    );
                }
            }
        }
    };

    // stops the reporters once every source is done
    coordinator.request("all sources finished");
    futures::future::join_all(reporters).await;

    let mut failed = 0;
    for (runner, result) in runners.iter().zip(results) {
        match result {
            Ok(Ok(outcome)) => {
                if outcome.is_fatal() {
                    failed += 1;
                }
                let summary = runner.meter().summary();
                match &outcome.termination {
                    TerminationReason::Fatal(e) => error!(
                        "Source '{}' failed after {} records: {}",
                        runner.name(),
                        outcome.records_forwarded,
                        e
                    ),
                    reason => info!(
                        "Source '{}' {} after {} records ({})",
                        runner.name(),
                        reason,
                        outcome.records_forwarded,
                        summary
                    ),
                }
            }
            Ok(Err(e)) => {
                failed += 1;
                error!("Source '{}' failed: {}", runner.name(), e);
            }
            Err(e) => {
                failed += 1;
                error!("Source '{}' task panicked: {}", runner.name(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} source(s) failed", failed);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn bench(args: BenchArgs) -> Result<()> {
    let config = args.into_config()?;

    let coordinator = Arc::new(ShutdownCoordinator::new(CancellationSignal::new()));
    coordinator.clone().listen();

    let report = run_bench(config, coordinator)
        .await
        .context("Benchmark failed")?;
    println!("{}", report);

    if let TerminationReason::Fatal(e) = &report.termination {
        anyhow::bail!("Benchmark ended with an error: {}", e);
    }
    Ok(())
}

fn validate_config(config: &ConnectConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Sources:");
    if config.sources.is_empty() {
        println!("  (none)");
    }
    for (name, source) in &config.sources {
        println!(
            "  {} [{}] → {} ({}){}",
            name,
            source.connector,
            source.topic,
            match source.sink.sink_type {
                streamgate_connect::config::SinkType::Stdout => "stdout",
                streamgate_connect::config::SinkType::Null => "null",
            },
            if source.enabled { "" } else { " (disabled)" }
        );
        if source.rate_limit.is_enabled() {
            println!(
                "      rate limit: {}/s (burst {})",
                source.rate_limit.events_per_second,
                source.rate_limit.effective_burst()
            );
        }
    }
    println!();

    let settings = &config.settings;
    println!("Settings:");
    println!(
        "  Retry: {} attempts, {}ms → {}ms (x{})",
        settings.retry.max_attempts,
        settings.retry.initial_backoff_ms,
        settings.retry.max_backoff_ms,
        settings.retry.backoff_multiplier
    );
    println!("  Throughput: {}", settings.throughput.window_policy());
    println!("  Shutdown timeout: {}ms", settings.shutdown_timeout_ms);

    Ok(())
}

/// Show the JSON Schema of a connector's config block
fn show_schema(connector: &str, format: &str) -> Result<()> {
    let registry = create_source_registry();
    let factory = registry.get(connector).with_context(|| {
        format!(
            "Unknown connector type: '{}'\nUse 'streamgate-connect connectors' to list available types",
            connector
        )
    })?;

    let schema = factory
        .spec()
        .config_schema
        .context("Connector has no config schema")?;

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }

    Ok(())
}

/// List available connector types
fn list_connectors() -> Result<()> {
    let registry = create_source_registry();

    println!("{:<12} {:<10} Description", "Name", "Version");
    println!("──────────────────────────────────────────────────────────────");
    for (name, spec) in registry.list() {
        println!(
            "{:<12} {:<10} {}",
            name,
            spec.version,
            spec.description.unwrap_or_default()
        );
    }
    Ok(())
}
