//! In-process workspace
//!
//! Behaves like a remote workspace (token check, topic lookup, paged
//! fetches, handle release) without any network. Faults can be injected
//! per call, and fetches can be held at a [`FetchGate`] so tests can close
//! a session while a fetch is in flight.

use super::{prepend_workspace_id, FetchBatch, FetchRequest, WorkspaceTransport};
use crate::error::{ConnectorError, ConnectorResult};
use crate::record::Record;
use crate::types::SensitiveString;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Handle issued by [`MemoryWorkspace::authenticate`]
#[derive(Debug)]
pub struct MemoryHandle {
    pub id: u64,
}

#[derive(Debug, Default)]
struct MemoryTopic {
    records: Vec<Record>,
    /// No more records will be appended
    sealed: bool,
}

/// Holds fetches until the test lets them through
#[derive(Debug, Default)]
pub struct FetchGate {
    entered: Notify,
    proceed: Notify,
}

impl FetchGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until a fetch is parked at the gate
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one parked fetch continue
    pub fn open(&self) {
        self.proceed.notify_one();
    }
}

/// A workspace that lives in memory
#[derive(Debug)]
pub struct MemoryWorkspace {
    workspace_id: String,
    token: String,
    reachable: AtomicBool,
    topics: Mutex<HashMap<String, MemoryTopic>>,
    faults: Mutex<VecDeque<ConnectorError>>,
    gate: Mutex<Option<Arc<FetchGate>>>,
    next_handle: AtomicU64,
    handles_issued: AtomicU64,
    handles_released: AtomicU64,
    fetches: AtomicU64,
}

impl MemoryWorkspace {
    /// Workspace `workspace_id` accepting exactly `token`
    pub fn new(workspace_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            token: token.into(),
            reachable: AtomicBool::new(true),
            topics: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            handles_issued: AtomicU64::new(0),
            handles_released: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Add a topic whose records are all known up front (ends the stream)
    pub fn with_topic(self, name: &str, records: Vec<Record>) -> Self {
        self.topics.lock().insert(
            prepend_workspace_id(&self.workspace_id, name),
            MemoryTopic {
                records,
                sealed: true,
            },
        );
        self
    }

    /// Add a topic that stays open for appends
    pub fn with_open_topic(self, name: &str) -> Self {
        self.topics.lock().insert(
            prepend_workspace_id(&self.workspace_id, name),
            MemoryTopic::default(),
        );
        self
    }

    /// Append a record to an existing topic
    pub fn append(&self, name: &str, record: Record) {
        let id = prepend_workspace_id(&self.workspace_id, name);
        if let Some(topic) = self.topics.lock().get_mut(&id) {
            topic.records.push(record);
        }
    }

    /// Simulate the environment going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next fetches with these errors, in order
    pub fn inject_fetch_faults(&self, faults: impl IntoIterator<Item = ConnectorError>) {
        self.faults.lock().extend(faults);
    }

    /// Park every following fetch at `gate` until it is opened
    pub fn hold_fetches(&self, gate: Arc<FetchGate>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn handles_issued(&self) -> u64 {
        self.handles_issued.load(Ordering::SeqCst)
    }

    pub fn handles_released(&self) -> u64 {
        self.handles_released.load(Ordering::SeqCst)
    }

    /// Handles issued and not yet released
    pub fn open_handles(&self) -> u64 {
        self.handles_issued() - self.handles_released()
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceTransport for MemoryWorkspace {
    type Handle = MemoryHandle;

    async fn authenticate(
        &self,
        workspace_id: &str,
        token: &SensitiveString,
    ) -> ConnectorResult<MemoryHandle> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ConnectorError::unavailable(format!(
                "workspace '{}' is unreachable",
                workspace_id
            )));
        }
        if token.expose_secret() != self.token {
            return Err(ConnectorError::auth("token is invalid or expired"));
        }
        if workspace_id != self.workspace_id {
            return Err(ConnectorError::NotFound(format!(
                "no workspace with id or name '{}'",
                workspace_id
            )));
        }

        self.handles_issued.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn resolve_topic(&self, _handle: &MemoryHandle, topic: &str) -> ConnectorResult<String> {
        let id = prepend_workspace_id(&self.workspace_id, topic);
        if self.topics.lock().contains_key(&id) {
            Ok(id)
        } else {
            Err(ConnectorError::NotFound(format!(
                "topic '{}' not found in workspace '{}'",
                topic, self.workspace_id
            )))
        }
    }

    async fn fetch(
        &self,
        _handle: &MemoryHandle,
        request: FetchRequest,
    ) -> ConnectorResult<FetchBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.proceed.notified().await;
        }

        let fault = self.faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault);
        }

        let topics = self.topics.lock();
        let topic = topics.get(&request.topic).ok_or_else(|| {
            ConnectorError::NotFound(format!("topic '{}' not found", request.topic))
        })?;

        let start = usize::try_from(request.offset)
            .unwrap_or(usize::MAX)
            .min(topic.records.len());
        let end = start
            .saturating_add(request.max_records.max(1))
            .min(topic.records.len());
        let records: Vec<Record> = topic.records[start..end]
            .iter()
            .enumerate()
            .map(|(i, r)| r.clone().with_offset((start + i) as u64))
            .collect();

        Ok(FetchBatch {
            records,
            next_offset: end as u64,
            end_of_stream: topic.sealed && end >= topic.records.len(),
        })
    }

    async fn release(&self, _handle: &MemoryHandle) -> ConnectorResult<()> {
        self.handles_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::new("orders", i.to_string())).collect()
    }

    #[tokio::test]
    async fn test_rejects_wrong_token() {
        let ws = MemoryWorkspace::new("12345", "good");
        let err = ws
            .authenticate("12345", &SensitiveString::new("expired"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Auth(_)));
        assert_eq!(ws.handles_issued(), 0);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let ws = MemoryWorkspace::new("12345", "good");
        ws.set_reachable(false);
        let err = ws
            .authenticate("12345", &SensitiveString::new("good"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_pages_through_sealed_topic() {
        let ws = MemoryWorkspace::new("12345", "good").with_topic("orders", records(5));
        let handle = ws
            .authenticate("12345", &SensitiveString::new("good"))
            .await
            .unwrap();
        let topic = ws.resolve_topic(&handle, "orders").await.unwrap();
        assert_eq!(topic, "12345-orders");

        let first = ws
            .fetch(
                &handle,
                FetchRequest {
                    topic: topic.clone(),
                    offset: 0,
                    max_records: 3,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.next_offset, 3);
        assert!(!first.end_of_stream);

        let second = ws
            .fetch(
                &handle,
                FetchRequest {
                    topic,
                    offset: 3,
                    max_records: 3,
                },
            )
            .await
            .unwrap();
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[0].offset, Some(3));
        assert!(second.end_of_stream);
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let ws = MemoryWorkspace::new("12345", "good");
        let handle = ws
            .authenticate("12345", &SensitiveString::new("good"))
            .await
            .unwrap();
        let err = ws.resolve_topic(&handle, "missing").await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotFound(_)));
    }
}
