//! Single-flight coordination for access-token renewal.
//!
//! The gate is either `Idle` or `Refreshing`. The first caller that finds it
//! idle becomes the leader and owns a [`RefreshLease`]; callers arriving while
//! a refresh is in flight queue up as waiters. Settling the lease drains every
//! waiter in arrival order and returns the gate to `Idle` inside one critical
//! section.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use crate::api::ApiError;

/// Why a refresh did not produce a new access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub reason: String,
}

impl RefreshFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl From<RefreshFailure> for ApiError {
    fn from(failure: RefreshFailure) -> Self {
        ApiError::AuthExpired(failure.reason)
    }
}

/// New access token, or the failure every participant receives.
pub type RefreshOutcome = Result<String, RefreshFailure>;

type Waiter = oneshot::Sender<RefreshOutcome>;

enum RefreshPhase {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

/// What a caller that hit a 401 should do next.
pub enum Ticket {
    /// The stored token already differs from the one that was rejected.
    Current(String),
    /// Start the refresh and settle the lease when done.
    Leader(RefreshLease),
    /// Wait for the refresh someone else started.
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

pub struct RefreshGate {
    phase: Mutex<RefreshPhase>,
}

impl RefreshGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: Mutex::new(RefreshPhase::Idle),
        })
    }

    fn phase(&self) -> MutexGuard<'_, RefreshPhase> {
        // The phase is only ever swapped whole, so a poisoned value is still coherent.
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide between reusing a newer token, leading, or waiting.
    ///
    /// `rejected` is the token the failed request carried and `current` reads
    /// the stored one. Both the check and the state transition happen under
    /// the gate lock.
    pub fn join<E>(
        self: &Arc<Self>,
        rejected: Option<&str>,
        current: impl FnOnce() -> Result<Option<String>, E>,
    ) -> Result<Ticket, E> {
        let mut phase = self.phase();

        if let Some(stored) = current()? {
            if rejected != Some(stored.as_str()) {
                return Ok(Ticket::Current(stored));
            }
        }

        match &mut *phase {
            RefreshPhase::Refreshing { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                debug!(queued = waiters.len(), "Refresh in flight, queued waiter");
                Ok(Ticket::Waiter(rx))
            }
            RefreshPhase::Idle => {
                *phase = RefreshPhase::Refreshing {
                    waiters: VecDeque::new(),
                };
                Ok(Ticket::Leader(RefreshLease {
                    gate: Arc::clone(self),
                    settled: false,
                }))
            }
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.phase(), RefreshPhase::Refreshing { .. })
    }

    pub fn waiting(&self) -> usize {
        match &*self.phase() {
            RefreshPhase::Refreshing { waiters } => waiters.len(),
            RefreshPhase::Idle => 0,
        }
    }

    fn settle(&self, outcome: RefreshOutcome) -> usize {
        let mut phase = self.phase();
        let previous = std::mem::replace(&mut *phase, RefreshPhase::Idle);
        let RefreshPhase::Refreshing { mut waiters } = previous else {
            return 0;
        };

        let count = waiters.len();
        while let Some(waiter) = waiters.pop_front() {
            // A closed receiver means that caller gave up; nothing to deliver.
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Ownership of the in-flight refresh.
///
/// Dropping an unsettled lease fails all waiters, so a panicking or aborted
/// refresh can never leave the gate stuck in `Refreshing`.
pub struct RefreshLease {
    gate: Arc<RefreshGate>,
    settled: bool,
}

impl RefreshLease {
    /// Deliver `outcome` to every waiter and reopen the gate.
    /// Returns how many waiters were released.
    pub fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        self.gate.settle(outcome)
    }
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.settle(Err(RefreshFailure::new("token refresh was abandoned")));
        }
    }
}
