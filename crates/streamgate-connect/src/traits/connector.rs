//! Source connector trait
//!
//! A source connector is a pull-based capability set:
//!
//! ```text
//!   Created ──connect()──▶ Connected ──produce_next()──▶ Streaming
//!      │                      │                             │
//!      └──────── close() ─────┴──────────── close() ────────┴──▶ Closed
//! ```
//!
//! The caller drives [`SourceConnector::produce_next`], so it decides when
//! to look at the cancellation signal. At most one record is ever in
//! flight without having been checked against it.
//!
//! A source whose `produce_next()` can wait indefinitely (an idle remote
//! topic) hands out an [`InFlightCancel`] before the call starts. The run
//! loop fires it when cancellation arrives mid-call; the pending call then
//! ends with either its record or `ConnectorError::Cancelled`.

use crate::error::{ConnectorError, ConnectorResult};
use crate::record::{Cursor, Record};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Wakes a `produce_next()` call that is waiting for data
#[async_trait]
pub trait InFlightCancel: Send + Sync {
    /// Release what the pending call is waiting on. Must be idempotent and
    /// must not wait for the pending call.
    async fn cancel_in_flight(&self);
}

/// Outcome of a successful `produce_next` call
#[derive(Debug, Clone, PartialEq)]
pub enum Produced {
    /// Next record from the source
    Record(Record),
    /// The source is exhausted; no more records will follow
    EndOfStream,
}

impl Produced {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Trait for source connectors
///
/// Implementations must keep their calls cancellation-agnostic: the run
/// loop never aborts a pending `produce_next`, it only stops calling it.
///
/// # Example
///
/// ```rust,ignore
/// use streamgate_connect::prelude::*;
///
/// struct Countdown { left: u32, lifecycle: Lifecycle }
///
/// #[async_trait]
/// impl SourceConnector for Countdown {
///     fn name(&self) -> &str { "countdown" }
///     fn topic(&self) -> &str { "numbers" }
///     fn state(&self) -> ConnectorState { self.lifecycle.state() }
///
///     async fn connect(&mut self) -> ConnectorResult<()> {
///         self.lifecycle.begin_connect()?;
///         self.lifecycle.mark_connected();
///         Ok(())
///     }
///
///     async fn produce_next(&mut self) -> ConnectorResult<Produced> {
///         self.lifecycle.begin_produce()?;
///         if self.left == 0 {
///             return Ok(Produced::EndOfStream);
///         }
///         self.left -= 1;
///         Ok(Produced::Record(Record::new("numbers", self.left.to_string())))
///     }
///
///     async fn close(&mut self) {
///         self.lifecycle.close();
///     }
/// }
/// ```
#[async_trait]
pub trait SourceConnector: Send {
    /// Connector instance name (from configuration)
    fn name(&self) -> &str;

    /// Local topic that produced records are destined for
    fn topic(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> ConnectorState;

    /// Resume position of the last produced record, if the source has one
    fn cursor(&self) -> Option<Cursor> {
        None
    }

    /// Hook for waking a blocked `produce_next()` from the cancellation side.
    ///
    /// Sources whose calls always finish promptly keep the default.
    fn in_flight_cancel(&self) -> Option<Arc<dyn InFlightCancel>> {
        None
    }

    /// Establish (and authenticate) the connection.
    ///
    /// Created → Connected. Fails with `Auth` or `Unavailable`, after which
    /// the connector is Closed; calling it twice is a contract violation and
    /// fails with `Fatal`.
    async fn connect(&mut self) -> ConnectorResult<()>;

    /// Wait for the next record.
    ///
    /// Valid in Connected/Streaming. Returns `Transient` for faults worth
    /// retrying; any other error means the caller must stop and close.
    async fn produce_next(&mut self) -> ConnectorResult<Produced>;

    /// Release everything the connector holds.
    ///
    /// Idempotent, never fails, valid from every state.
    async fn close(&mut self);
}

/// Connector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Created,
    Connected,
    Streaming,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connected => write!(f, "connected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State machine shared by connector implementations.
///
/// Every guard returns `Fatal` naming the current and allowed states, so
/// contract violations surface the same way for every connector kind.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectorState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectorState::Created,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectorState::Closed
    }

    /// Guard for `connect()`: only allowed once, from Created
    pub fn begin_connect(&self) -> ConnectorResult<()> {
        self.require("connect()", &[ConnectorState::Created])
    }

    /// Created → Connected, after the connection has been established
    pub fn mark_connected(&mut self) {
        if self.state == ConnectorState::Created {
            self.state = ConnectorState::Connected;
        }
    }

    /// Guard for `produce_next()`: Connected → Streaming on first use
    pub fn begin_produce(&mut self) -> ConnectorResult<()> {
        self.require(
            "produce_next()",
            &[ConnectorState::Connected, ConnectorState::Streaming],
        )?;
        self.state = ConnectorState::Streaming;
        Ok(())
    }

    /// A failed `connect()` is terminal: Created → Closed, so it cannot be retried
    pub fn fail_connect(&mut self) {
        if self.state == ConnectorState::Created {
            self.state = ConnectorState::Closed;
        }
    }

    /// Any state → Closed. Returns `false` if the lifecycle was already closed.
    pub fn close(&mut self) -> bool {
        let was_open = self.state != ConnectorState::Closed;
        self.state = ConnectorState::Closed;
        was_open
    }

    fn require(&self, operation: &str, allowed: &[ConnectorState]) -> ConnectorResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let allowed = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(ConnectorError::fatal(format!(
            "{} is not allowed in state {} (allowed: {})",
            operation, self.state, allowed
        )))
    }
}
