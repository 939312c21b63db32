//! Authenticated connection to a workspace
//!
//! A [`ConnectionSession`] owns the handle issued by its transport. The
//! handle lives in a slot that is either `Unopened`, `Open(handle)` or
//! `Closed`, so "handle present iff open" holds by construction.
//!
//! Calls clone the handle out of the slot and never hold the lock across
//! I/O. A `close()` racing an in-flight fetch therefore neither blocks nor
//! corrupts it: the fetch finishes with its own result, and every later
//! call fails with `Fatal("session closed")`. Waiters on [`closed`](ConnectionSession::closed)
//! are woken as soon as a close starts.

use crate::error::{ConnectorError, ConnectorResult};
use crate::shutdown::CancellationSignal;
use crate::traits::connector::InFlightCancel;
use crate::types::SensitiveString;
use crate::workspace::{FetchBatch, FetchRequest, WorkspaceTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unopened => write!(f, "unopened"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

enum SessionSlot<H> {
    Unopened,
    Open(Arc<H>),
    Closed,
}

impl<H> SessionSlot<H> {
    fn state(&self) -> SessionState {
        match self {
            Self::Unopened => SessionState::Unopened,
            Self::Open(_) => SessionState::Open,
            Self::Closed => SessionState::Closed,
        }
    }
}

/// Session against one workspace, torn down exactly once
pub struct ConnectionSession<T: WorkspaceTransport> {
    workspace_id: String,
    token: SensitiveString,
    transport: Arc<T>,
    slot: Mutex<SessionSlot<T::Handle>>,
    closing: CancellationSignal,
}

impl<T: WorkspaceTransport> ConnectionSession<T> {
    /// Create an unopened session; no I/O happens until [`connect`](Self::connect)
    pub fn new(transport: Arc<T>, workspace_id: impl Into<String>, token: SensitiveString) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            token,
            transport,
            slot: Mutex::new(SessionSlot::Unopened),
            closing: CancellationSignal::new(),
        }
    }

    /// Create and connect in one step
    pub async fn open(
        transport: Arc<T>,
        workspace_id: impl Into<String>,
        token: SensitiveString,
    ) -> ConnectorResult<Self> {
        let session = Self::new(transport, workspace_id, token);
        session.connect().await?;
        Ok(session)
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn state(&self) -> SessionState {
        self.slot.lock().state()
    }

    /// Authenticate and store the handle.
    ///
    /// On `Auth`/`Unavailable` the session stays Unopened and holds nothing.
    pub async fn connect(&self) -> ConnectorResult<()> {
        let state = self.state();
        if state != SessionState::Unopened {
            return Err(ConnectorError::fatal(format!(
                "cannot connect a session that is {}",
                state
            )));
        }

        let handle = Arc::new(
            self.transport
                .authenticate(&self.workspace_id, &self.token)
                .await?,
        );

        let installed = {
            let mut slot = self.slot.lock();
            if matches!(*slot, SessionSlot::Unopened) {
                *slot = SessionSlot::Open(handle.clone());
                true
            } else {
                false
            }
        };

        if !installed {
            // closed (or opened by someone else) while authenticating
            self.release(&handle).await;
            return Err(ConnectorError::fatal("session closed while connecting"));
        }

        info!(workspace = %self.workspace_id, "Session opened");
        Ok(())
    }

    /// Map a configured topic to its id in the workspace
    pub async fn resolve_topic(&self, topic: &str) -> ConnectorResult<String> {
        let handle = self.handle()?;
        self.transport.resolve_topic(&handle, topic).await
    }

    /// Fetch one page of records
    pub async fn fetch(&self, request: FetchRequest) -> ConnectorResult<FetchBatch> {
        let handle = self.handle()?;
        self.transport.fetch(&handle, request).await
    }

    /// Release the handle. Idempotent and infallible; release failures are
    /// logged.
    pub async fn close(&self) {
        self.closing.request();
        let previous = {
            let mut slot = self.slot.lock();
            std::mem::replace(&mut *slot, SessionSlot::Closed)
        };

        match previous {
            SessionSlot::Open(handle) => {
                self.release(&handle).await;
                info!(workspace = %self.workspace_id, "Session closed");
            }
            SessionSlot::Unopened => {
                debug!(workspace = %self.workspace_id, "Closed session that was never opened");
            }
            SessionSlot::Closed => {}
        }
    }

    /// Whether `close()` has been called
    pub fn is_closing(&self) -> bool {
        self.closing.is_requested()
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    fn handle(&self) -> ConnectorResult<Arc<T::Handle>> {
        match &*self.slot.lock() {
            SessionSlot::Open(handle) => Ok(handle.clone()),
            SessionSlot::Unopened => Err(ConnectorError::fatal("session not open")),
            SessionSlot::Closed => Err(ConnectorError::fatal("session closed")),
        }
    }

    async fn release(&self, handle: &T::Handle) {
        if let Err(e) = self.transport.release(handle).await {
            warn!(
                workspace = %self.workspace_id,
                "Failed to release session handle: {}",
                e
            );
        }
    }
}

#[async_trait]
impl<T: WorkspaceTransport> InFlightCancel for ConnectionSession<T> {
    async fn cancel_in_flight(&self) {
        self.close().await;
    }
}

impl<T: WorkspaceTransport> fmt::Debug for ConnectionSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("workspace_id", &self.workspace_id)
            .field("token", &self.token)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: WorkspaceTransport> Drop for ConnectionSession<T> {
    fn drop(&mut self) {
        if let SessionSlot::Open(_) = self.slot.get_mut() {
            warn!(
                workspace = %self.workspace_id,
                "Session dropped while open; handle was not released"
            );
        }
    }
}
