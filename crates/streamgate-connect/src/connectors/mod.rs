//! Built-in connectors
//!
//! Sources are looked up by type name through the [`SourceRegistry`]:
//!
//! | Type | Source |
//! |------|--------|
//! | `workspace` | [`workspace::WorkspaceSource`] over the portal HTTP API |
//! | `datagen` | [`datagen::DatagenSource`], synthetic load |
//!
//! Sinks are picked from the source's `sink` block: `stdout` or `null`.

pub mod datagen;
pub mod stdout;
pub mod workspace;

use crate::config::{SinkConfig, SinkType};
use crate::traits::registry::SourceRegistry;
use crate::traits::sink::{NullSink, RecordSink};
use std::sync::Arc;

pub use datagen::{DatagenConfig, DatagenSource, DatagenSourceFactory, DataPattern};
pub use stdout::{OutputFormat, StdoutSink, StdoutSinkConfig};
pub use workspace::{WorkspaceSource, WorkspaceSourceConfig, WorkspaceSourceFactory};

/// Create a source registry with every built-in source
pub fn create_source_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register("workspace", Arc::new(WorkspaceSourceFactory));
    registry.register("datagen", Arc::new(DatagenSourceFactory));
    registry
}

/// Build the sink described by a source's `sink` block
pub fn create_sink(config: &SinkConfig) -> Arc<dyn RecordSink> {
    match config.sink_type {
        SinkType::Stdout => Arc::new(StdoutSink::new(StdoutSinkConfig {
            format: config.format,
            ..Default::default()
        })),
        SinkType::Null => Arc::new(NullSink::new()),
    }
}
