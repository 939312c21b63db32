//! Cooperative shutdown
//!
//! [`CancellationSignal`] is a one-way flag: Active until the first
//! `request()`, Requested forever after. Run loops poll it between
//! deliveries and race it against backoff sleeps; nothing is ever
//! interrupted mid-call.
//!
//! [`ShutdownCoordinator`] turns operator interrupts into that single
//! transition. Repeated interrupts are absorbed: they are logged and
//! counted but never escalate to a forced exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct SignalInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared, cloneable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to Requested.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn request(&self) -> bool {
        let transitioned = self
            .inner
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            self.inner.notify.notify_waiters();
        }
        transitioned
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent request cannot slip by
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Maps external interrupts onto a [`CancellationSignal`]
#[derive(Debug)]
pub struct ShutdownCoordinator {
    signal: CancellationSignal,
    interrupts: AtomicU64,
}

impl ShutdownCoordinator {
    pub fn new(signal: CancellationSignal) -> Self {
        Self {
            signal,
            interrupts: AtomicU64::new(0),
        }
    }

    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Handle one interrupt.
    ///
    /// The first call requests cancellation and returns `true`; later calls
    /// are absorbed and return `false`.
    pub fn interrupt(&self) -> bool {
        let count = self.interrupts.fetch_add(1, Ordering::AcqRel) + 1;
        if self.signal.request() {
            info!("Shutdown requested, finishing in-flight work");
            true
        } else {
            warn!(
                interrupts = count,
                "Shutdown already in progress, ignoring repeated interrupt"
            );
            false
        }
    }

    /// Number of interrupts received so far
    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::Acquire)
    }

    /// Listen for Ctrl+C for the rest of the process lifetime.
    ///
    /// The handler stays installed after the first interrupt, so later
    /// Ctrl+C presses reach [`interrupt`](Self::interrupt) instead of the
    /// platform default (which would kill the process).
    pub fn listen(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        self.interrupt();
                    }
                    Err(e) => {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
        })
    }

    /// Request cancellation without an interrupt (e.g. `--duration-secs` elapsed)
    pub fn request(&self, reason: &str) -> bool {
        let transitioned = self.signal.request();
        if transitioned {
            info!(reason, "Shutdown requested");
        } else {
            debug!(reason, "Shutdown already requested");
        }
        transitioned
    }
}
