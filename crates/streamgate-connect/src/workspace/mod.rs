//! Remote workspace access
//!
//! A workspace is a broker-backed environment reachable only with a
//! short-lived token. [`WorkspaceTransport`] is the seam between the
//! [`ConnectionSession`](crate::session::ConnectionSession) and the wire:
//!
//! - [`http::HttpWorkspaceTransport`] talks to the portal HTTP API
//! - [`memory::MemoryWorkspace`] keeps everything in process, for tests and demos

pub mod http;
pub mod memory;

use crate::error::ConnectorResult;
use crate::record::Record;
use crate::types::SensitiveString;
use async_trait::async_trait;

pub use http::{BrokerInfo, BrokerSettings, HttpWorkspaceTransport, PortalConfig, WorkspaceInfo};
pub use memory::{FetchGate, MemoryWorkspace};

/// One page request against a workspace topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Resolved topic id
    pub topic: String,
    /// First offset to return
    pub offset: u64,
    pub max_records: usize,
}

/// One page of records
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub records: Vec<Record>,
    /// Offset to ask for next
    pub next_offset: u64,
    /// The topic is sealed and `next_offset` is past its last record
    pub end_of_stream: bool,
}

/// Wire access to a workspace
#[async_trait]
pub trait WorkspaceTransport: Send + Sync + 'static {
    /// Authenticated resource held while a session is open
    type Handle: Send + Sync + 'static;

    /// Exchange the token for a handle.
    ///
    /// Fails with `Auth` for a rejected token and `Unavailable` when the
    /// environment can not be reached.
    async fn authenticate(
        &self,
        workspace_id: &str,
        token: &SensitiveString,
    ) -> ConnectorResult<Self::Handle>;

    /// Map a configured topic name onto the id used for fetches
    async fn resolve_topic(&self, _handle: &Self::Handle, topic: &str) -> ConnectorResult<String> {
        Ok(topic.to_string())
    }

    async fn fetch(&self, handle: &Self::Handle, request: FetchRequest)
        -> ConnectorResult<FetchBatch>;

    /// Give the handle back. Called at most once per handle.
    async fn release(&self, handle: &Self::Handle) -> ConnectorResult<()>;
}

/// Prefix a topic name with the workspace id, unless it already has it
pub fn prepend_workspace_id(workspace_id: &str, topic: &str) -> String {
    let prefix = format!("{}-", workspace_id);
    if topic.starts_with(&prefix) {
        topic.to_string()
    } else {
        format!("{}{}", prefix, topic)
    }
}

/// Remove a leading `{workspace_id}-` from a topic id
pub fn strip_workspace_id_prefix(workspace_id: &str, topic: &str) -> String {
    let prefix = format!("{}-", workspace_id);
    topic.strip_prefix(&prefix).unwrap_or(topic).to_string()
}
