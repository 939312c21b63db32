//! Workspace source connector
//!
//! Pulls records from a topic of a remote workspace and hands them to the
//! run loop one by one. The connector exclusively owns its
//! [`ConnectionSession`]; closing the connector closes the session.
//!
//! Records are fetched in pages of `batch_size`. An empty page on a topic
//! that is still open makes the connector sleep `poll_interval_ms` and ask
//! again, so `produce_next()` blocks until a record shows up. The session
//! doubles as the connector's [`InFlightCancel`]: closing it from the
//! cancellation side ends that wait with `ConnectorError::Cancelled`.
//!
//! # Example Configuration
//!
//! ```yaml
//! sources:
//!   orders:
//!     connector: workspace
//!     topic: orders
//!     config:
//!       workspace_id: "12345"
//!       token: ${WORKSPACE_TOKEN}
//!       portal_url: https://portal.example.com/api
//!       remote_topic: orders
//!       batch_size: 500
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::record::{Cursor, Record};
use crate::session::ConnectionSession;
use crate::traits::connector::{
    ConnectorState, InFlightCancel, Lifecycle, Produced, SourceConnector,
};
use crate::traits::registry::{ConnectorSpec, SourceFactory};
use crate::types::SensitiveString;
use crate::workspace::{
    FetchRequest, HttpWorkspaceTransport, PortalConfig, WorkspaceTransport,
};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Workspace source configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct WorkspaceSourceConfig {
    /// Workspace id (or name)
    #[validate(length(min = 1))]
    pub workspace_id: String,

    /// Short-lived workspace access token
    pub token: SensitiveString,

    /// Portal base URL
    #[validate(url)]
    pub portal_url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Topic to read inside the workspace (defaults to the local topic)
    #[serde(default)]
    pub remote_topic: Option<String>,

    /// Records per fetch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: usize,

    /// Wait between fetches that returned nothing
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Offset to start reading from
    #[serde(default)]
    pub start_offset: u64,
}

impl WorkspaceSourceConfig {
    pub fn new(
        workspace_id: impl Into<String>,
        token: impl Into<SensitiveString>,
        portal_url: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            token: token.into(),
            portal_url: portal_url.into(),
            timeout_ms: default_timeout_ms(),
            remote_topic: None,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            start_offset: 0,
        }
    }

    /// Validate, including the fields `validator` can not see
    pub fn check(&self) -> ConnectorResult<()> {
        self.validate()
            .map_err(|e| ConnectorError::config(format!("invalid workspace config: {}", e)))?;
        if self.token.is_empty() {
            return Err(ConnectorError::config("workspace token must not be empty"));
        }
        Ok(())
    }

    pub fn portal(&self) -> PortalConfig {
        PortalConfig {
            portal_url: self.portal_url.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Source connector backed by a remote workspace topic
pub struct WorkspaceSource<T: WorkspaceTransport> {
    name: String,
    topic: String,
    remote_topic: String,
    session: Arc<ConnectionSession<T>>,
    lifecycle: Lifecycle,
    resolved_topic: Option<String>,
    buffer: VecDeque<Record>,
    fetch_offset: u64,
    /// Offset following the last record handed out
    position: Option<u64>,
    end_of_stream: bool,
    batch_size: usize,
    poll_interval: Duration,
}

impl<T: WorkspaceTransport> WorkspaceSource<T> {
    /// Build an unconnected source; nothing touches the network until `connect()`
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        transport: Arc<T>,
        config: &WorkspaceSourceConfig,
    ) -> ConnectorResult<Self> {
        config.check()?;
        let topic = topic.into();
        Ok(Self {
            name: name.into(),
            remote_topic: config.remote_topic.clone().unwrap_or_else(|| topic.clone()),
            topic,
            session: Arc::new(ConnectionSession::new(
                transport,
                config.workspace_id.clone(),
                config.token.clone(),
            )),
            lifecycle: Lifecycle::new(),
            resolved_topic: None,
            buffer: VecDeque::new(),
            fetch_offset: config.start_offset,
            position: None,
            end_of_stream: false,
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    pub fn session(&self) -> &ConnectionSession<T> {
        &self.session
    }

    async fn fill_buffer(&mut self, topic: &str) -> ConnectorResult<()> {
        loop {
            let fetched = self
                .session
                .fetch(FetchRequest {
                    topic: topic.to_string(),
                    offset: self.fetch_offset,
                    max_records: self.batch_size,
                })
                .await;
            let batch = match fetched {
                Ok(batch) => batch,
                // closed between the idle wait and the fetch
                Err(_) if self.session.is_closing() => return Err(self.cancelled()),
                Err(e) => return Err(e),
            };

            debug!(
                source = %self.name,
                offset = self.fetch_offset,
                records = batch.records.len(),
                end_of_stream = batch.end_of_stream,
                "Fetched page"
            );

            self.fetch_offset = batch.next_offset;
            self.end_of_stream = batch.end_of_stream;
            self.buffer.extend(batch.records);

            if !self.buffer.is_empty() || self.end_of_stream {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.session.closed() => {
                    debug!(source = %self.name, "Idle wait ended by session close");
                    return Err(self.cancelled());
                }
            }
        }
    }

    fn cancelled(&self) -> ConnectorError {
        ConnectorError::cancelled(format!(
            "source '{}' was waiting for records when its session closed",
            self.name
        ))
    }
}

#[async_trait]
impl<T: WorkspaceTransport> SourceConnector for WorkspaceSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    fn cursor(&self) -> Option<Cursor> {
        self.position.map(Cursor::from)
    }

    fn in_flight_cancel(&self) -> Option<Arc<dyn InFlightCancel>> {
        let session: Arc<dyn InFlightCancel> = self.session.clone();
        Some(session)
    }

    async fn connect(&mut self) -> ConnectorResult<()> {
        self.lifecycle.begin_connect()?;

        let opened = match self.session.connect().await {
            Ok(()) => self.session.resolve_topic(&self.remote_topic).await,
            Err(e) => Err(e),
        };
        let resolved = match opened {
            Ok(resolved) => resolved,
            Err(e) => {
                self.session.close().await;
                self.lifecycle.fail_connect();
                return Err(e);
            }
        };

        info!(
            source = %self.name,
            workspace = self.session.workspace_id(),
            remote_topic = %resolved,
            offset = self.fetch_offset,
            "Connected to workspace topic"
        );
        self.resolved_topic = Some(resolved);
        self.lifecycle.mark_connected();
        Ok(())
    }

    async fn produce_next(&mut self) -> ConnectorResult<Produced> {
        self.lifecycle.begin_produce()?;

        if self.buffer.is_empty() && !self.end_of_stream {
            let topic = self
                .resolved_topic
                .clone()
                .ok_or_else(|| ConnectorError::fatal("topic was not resolved"))?;
            self.fill_buffer(&topic).await?;
        }

        match self.buffer.pop_front() {
            Some(mut record) => {
                if let Some(offset) = record.offset {
                    self.position = Some(offset + 1);
                }
                record.topic.clone_from(&self.topic);
                Ok(Produced::Record(record))
            }
            None => Ok(Produced::EndOfStream),
        }
    }

    async fn close(&mut self) {
        if self.lifecycle.close() {
            self.buffer.clear();
            self.session.close().await;
            debug!(source = %self.name, "Workspace source closed");
        }
    }
}

/// Factory for [`WorkspaceSource`] over the portal HTTP API
pub struct WorkspaceSourceFactory;

impl SourceFactory for WorkspaceSourceFactory {
    fn spec(&self) -> ConnectorSpec {
        ConnectorSpec::new("workspace", env!("CARGO_PKG_VERSION"))
            .description("Streams records from a remote workspace topic")
            .config_schema::<WorkspaceSourceConfig>()
    }

    fn create(
        &self,
        name: &str,
        topic: &str,
        config: &serde_yaml::Value,
    ) -> ConnectorResult<Box<dyn SourceConnector>> {
        let config: WorkspaceSourceConfig = serde_yaml::from_value(config.clone())?;
        config.check()?;
        let transport = Arc::new(HttpWorkspaceTransport::new(&config.portal())?);
        Ok(Box::new(WorkspaceSource::new(name, topic, transport, &config)?))
    }
}
