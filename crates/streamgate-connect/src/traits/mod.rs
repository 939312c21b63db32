//! Core connector traits and types
//!
//! - `SourceConnector` - pull records from an external source
//! - `RecordSink` - accept records forwarded by the run loop
//! - `retry` - bounded exponential backoff for transient faults
//! - `registry` - runtime lookup of connector factories
//! - `testing` - scripted connectors and in-memory sinks for tests

pub mod connector;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod testing;

pub use connector::{ConnectorState, InFlightCancel, Lifecycle, Produced, SourceConnector};
pub use registry::{ConnectorSpec, SourceFactory, SourceRegistry};
pub use retry::{RetryConfig, RetryGuard};
pub use sink::{ChannelSink, NullSink, RecordSink};
pub use testing::{ConnectorProbe, MemorySink, ScriptedConnector, Step};
