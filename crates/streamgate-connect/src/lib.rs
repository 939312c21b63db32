//! streamgate-connect - Cancellable source connectors and a throughput harness
//!
//! Bridges topics of a remote, token-protected workspace into a local
//! pipeline, and measures sustained record throughput with a synthetic
//! source.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ ShutdownCoordinator ──▶ CancellationSignal                      │
//! │                              │ (observed between deliveries)    │
//! │                              ▼                                  │
//! │ SourceConnector ──produce_next──▶ RunLoop ──forward──▶ Sink     │
//! │  ├── WorkspaceSource (ConnectionSession → portal API)           │
//! │  └── DatagenSource (synthetic load)                             │
//! │                              │                                  │
//! │                              └──▶ ThroughputMeter (side channel)│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Library Usage
//!
//! ```rust,ignore
//! use streamgate_connect::prelude::*;
//!
//! let signal = CancellationSignal::new();
//! let mut source = DatagenSource::new("gen", "demo", DatagenConfig::default())?;
//! source.connect().await?;
//!
//! let sink = NullSink::new();
//! let outcome = RunLoop::new(&mut source, &sink, &signal).run().await;
//! println!("{} records, {}", outcome.records_forwarded, outcome.termination);
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Run all enabled sources
//! streamgate-connect -c streamgate.yaml
//!
//! # Measure throughput until Ctrl+C
//! streamgate-connect bench --events-per-second 0
//!
//! # Validate configuration
//! streamgate-connect -c streamgate.yaml validate
//! ```

// Core traits (connector, sink, retry, registry, testing)
pub mod traits;

// Common types (SensitiveString)
pub mod types;

// Error types
pub mod error;

pub mod record;

// Execution model
pub mod rate_limiter;
pub mod run_loop;
pub mod session;
pub mod shutdown;
pub mod throughput;

// Remote workspace transports
pub mod workspace;

// Runtime modules
pub mod bench;
pub mod config;
pub mod connectors;
pub mod source_runner;

pub use types::SensitiveString;

pub use traits::{
    ChannelSink, ConnectorSpec, ConnectorState, InFlightCancel, Lifecycle, NullSink, Produced,
    RecordSink, RetryConfig, RetryGuard, SourceConnector, SourceFactory, SourceRegistry,
};

// Test helpers, usable from downstream crates' tests as well
pub use traits::testing;

pub use error::{ConnectError, ConnectorError, ConnectorResult, ConnectorStatus, Result, SinkError};

pub use config::ConnectConfig;
pub use record::{Cursor, Record};
pub use run_loop::{RunLoop, RunOutcome, TerminationReason};
pub use session::{ConnectionSession, SessionState};
pub use shutdown::{CancellationSignal, ShutdownCoordinator};
pub use throughput::{
    ThroughputMeter, ThroughputReporter, ThroughputSample, ThroughputSnapshot, ThroughputSummary,
    WindowPolicy,
};

pub use async_trait::async_trait;

/// Everything needed to implement and drive a connector
pub mod prelude {
    pub use crate::{
        async_trait, CancellationSignal, ConnectorError, ConnectorResult, ConnectorState, Cursor,
        Lifecycle, NullSink, Produced, Record, RecordSink, RetryConfig, RunLoop, RunOutcome,
        SensitiveString, SinkError, SourceConnector, TerminationReason, ThroughputMeter,
        WindowPolicy,
    };

    pub use crate::connectors::datagen::{DatagenConfig, DatagenSource};
    pub use crate::workspace::{FetchBatch, FetchRequest, WorkspaceTransport};

    pub use schemars::JsonSchema;
    pub use validator::Validate;
}
