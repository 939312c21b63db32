//! Connector registry for runtime connector lookup
//!
//! The runtime only ever sees `Box<dyn SourceConnector>`; factories turn a
//! connector type name plus a raw YAML config into an instance.
//!
//! ```rust,ignore
//! use streamgate_connect::connectors::datagen::DatagenSourceFactory;
//! use streamgate_connect::SourceRegistry;
//! use std::sync::Arc;
//!
//! let mut sources = SourceRegistry::new();
//! sources.register("datagen", Arc::new(DatagenSourceFactory));
//! ```

use super::connector::SourceConnector;
use crate::error::ConnectorResult;
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Describes a connector type for the `connectors` and `schema` commands
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSpec {
    /// Connector type identifier (e.g., "workspace", "datagen")
    pub connector_type: String,
    pub version: String,
    pub description: Option<String>,
    /// JSON Schema of the connector's `config` block
    pub config_schema: Option<serde_json::Value>,
}

impl ConnectorSpec {
    pub fn new(connector_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            version: version.into(),
            description: None,
            config_schema: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach the JSON Schema generated from a config type
    pub fn config_schema<T: JsonSchema>(mut self) -> Self {
        let schema = schemars::schema_for!(T);
        self.config_schema = serde_json::to_value(schema).ok();
        self
    }
}

/// Factory trait for creating source instances
pub trait SourceFactory: Send + Sync {
    /// Describe the connector type this factory builds
    fn spec(&self) -> ConnectorSpec;

    /// Build a connector in the Created state.
    ///
    /// Only parses and validates `config`; no I/O happens before `connect()`.
    fn create(
        &self,
        name: &str,
        topic: &str,
        config: &serde_yaml::Value,
    ) -> ConnectorResult<Box<dyn SourceConnector>>;
}

/// Registry of available source connectors
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn SourceFactory>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    /// Register a source factory
    pub fn register(&mut self, name: &str, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(name.to_string(), factory);
    }

    /// Get a source factory by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn SourceFactory>> {
        self.sources.get(name)
    }

    /// List available source types with their specs, sorted by name
    pub fn list(&self) -> Vec<(&str, ConnectorSpec)> {
        self.sources
            .iter()
            .map(|(name, factory)| (name.as_str(), factory.spec()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
