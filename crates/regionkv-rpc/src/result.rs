//! Single-assignment result handles shared between a request and its caller.
//!
//! A [`ResultHandle`] is a cloneable reference to one outcome cell. Whoever
//! decides the fate of a request (the region client, or the facade after a
//! reroute) completes the cell exactly once; every clone observes the same
//! outcome. Completing twice is reported as [`RpcError::AlreadyCompleted`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, RpcError};

/// Outcome delivered through a [`ResultHandle`].
pub type RpcResult = Result<Bytes>;

struct Slot {
    outcome: Mutex<Option<RpcResult>>,
    notify: Notify,
}

/// Handle to the eventual outcome of one request.
#[derive(Clone)]
pub struct ResultHandle {
    slot: Arc<Slot>,
}

impl ResultHandle {
    /// Creates an unresolved handle.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                outcome: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolves the handle with a success payload.
    pub fn fulfill(&self, payload: Bytes) -> Result<()> {
        self.complete(Ok(payload))
    }

    /// Resolves the handle with a failure.
    pub fn fail(&self, err: RpcError) -> Result<()> {
        self.complete(Err(err))
    }

    fn complete(&self, outcome: RpcResult) -> Result<()> {
        {
            let mut slot = self.slot.outcome.lock();
            if slot.is_some() {
                return Err(RpcError::AlreadyCompleted);
            }
            *slot = Some(outcome);
        }
        self.slot.notify.notify_waiters();
        Ok(())
    }

    /// Returns true once the handle has been fulfilled or failed.
    pub fn is_complete(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Returns the outcome if the handle has already been resolved.
    pub fn try_outcome(&self) -> Option<RpcResult> {
        self.slot.outcome.lock().clone()
    }

    /// Waits until the handle is resolved.
    pub async fn wait(&self) -> RpcResult {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Waits for the outcome, giving up after `timeout`.
    pub async fn join(&self, timeout: Duration) -> RpcResult {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Returns true if both handles refer to the same outcome cell.
    pub fn same_as(&self, other: &ResultHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Default for ResultHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}
