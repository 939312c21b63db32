//! Source runner - builds one configured source and drives it to completion
//!
//! Features:
//! - Registry-based connector lookup
//! - Connection failures surface before the run loop is entered
//! - Status tracking (starting → running → stopped / failed)
//! - Per-source throughput meter and optional rate limiting

use crate::config::{GlobalSettings, SourceConfig};
use crate::connectors::create_sink;
use crate::error::{ConnectError, ConnectorStatus, Result};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::run_loop::{RunLoop, RunOutcome};
use crate::shutdown::CancellationSignal;
use crate::throughput::ThroughputMeter;
use crate::traits::registry::SourceRegistry;
use crate::traits::retry::RetryConfig;
use crate::traits::sink::RecordSink;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

/// Source runner state
pub struct SourceRunner {
    name: String,
    config: SourceConfig,
    retry: RetryConfig,
    sink: Arc<dyn RecordSink>,
    meter: Arc<ThroughputMeter>,
    rate_limiter: Option<TokenBucketRateLimiter>,
    status: RwLock<ConnectorStatus>,
    source_registry: Arc<SourceRegistry>,
}

impl SourceRunner {
    /// Create a runner for one configured source
    pub fn new(
        name: impl Into<String>,
        config: SourceConfig,
        settings: &GlobalSettings,
        source_registry: Arc<SourceRegistry>,
    ) -> Result<Self> {
        let meter = ThroughputMeter::new(settings.throughput.window_policy())?;
        let rate_limiter = config
            .rate_limit
            .is_enabled()
            .then(|| TokenBucketRateLimiter::new(config.rate_limit.clone()));

        Ok(Self {
            name: name.into(),
            sink: create_sink(&config.sink),
            config,
            retry: settings.retry.to_retry_config(),
            meter: Arc::new(meter),
            rate_limiter,
            status: RwLock::new(ConnectorStatus::Starting),
            source_registry,
        })
    }

    /// Replace the sink built from configuration
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ConnectorStatus {
        *self.status.read()
    }

    pub fn meter(&self) -> Arc<ThroughputMeter> {
        self.meter.clone()
    }

    /// Connect the source and run it until it stops.
    ///
    /// Connection failures (`Auth`, `Unavailable`, ...) are returned as
    /// errors and the run loop is never entered. Everything after a
    /// successful connect is reported through the [`RunOutcome`].
    pub async fn run(&self, signal: &CancellationSignal) -> Result<RunOutcome> {
        let connector_type = self.config.connector.as_str();
        let factory = self.source_registry.get(connector_type).ok_or_else(|| {
            let available: Vec<&str> = self
                .source_registry
                .list()
                .iter()
                .map(|(n, _)| *n)
                .collect();
            ConnectError::config(format!(
                "Unknown source connector type: '{}'. Available: {:?}",
                connector_type, available
            ))
        })?;

        let mut connector = factory
            .create(&self.name, &self.config.topic, &self.config.config)
            .inspect_err(|_| self.set_status(ConnectorStatus::Failed))?;

        info!(
            "Source '{}' connecting ({} → topic '{}')",
            self.name, connector_type, self.config.topic
        );

        if let Err(e) = connector.connect().await {
            error!("Source '{}' failed to connect: {}", self.name, e);
            connector.close().await;
            self.set_status(ConnectorStatus::Failed);
            return Err(e.into());
        }

        self.set_status(ConnectorStatus::Running);

        let mut run_loop = RunLoop::new(connector.as_mut(), self.sink.as_ref(), signal)
            .with_meter(&self.meter)
            .with_retry(self.retry.clone());
        if let Some(limiter) = &self.rate_limiter {
            run_loop = run_loop.with_rate_limiter(limiter);
        }
        let outcome = run_loop.run().await;

        self.set_status(if outcome.is_fatal() {
            ConnectorStatus::Failed
        } else {
            ConnectorStatus::Stopped
        });

        Ok(outcome)
    }

    fn set_status(&self, status: ConnectorStatus) {
        *self.status.write() = status;
    }
}
