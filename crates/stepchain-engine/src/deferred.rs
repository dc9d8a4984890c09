//! Work scheduled to run after the current response has gone out.
//!
//! Nothing awaits a deferred action, so it must report its own failures
//! (normally by failing the run in the store). Every action is spawned as
//! its own task: one failing or panicking never cancels another.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// A no-argument asynchronous action.
pub type DeferredAction = BoxFuture<'static, ()>;

pub trait DeferredTrigger: Send + Sync {
    /// Schedule `action`. `label` only appears in logs.
    fn defer(&self, label: String, action: DeferredAction);
}

/// Holds actions until [`AfterResponse::release`] is called, which the HTTP
/// layer does once the response body has been handed to the transport.
#[derive(Clone, Default)]
pub struct AfterResponse {
    pending: Arc<Mutex<Vec<(String, DeferredAction)>>>,
}

impl AfterResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of the actions still waiting, in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.iter().map(|(label, _)| label.clone()).collect())
            .unwrap_or_default()
    }

    /// Spawn every pending action. Returns how many were started.
    pub fn release(&self) -> usize {
        let actions = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if actions.is_empty() {
            return 0;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(dropped = actions.len(), "No runtime to run deferred actions");
                return 0;
            }
        };

        let count = actions.len();
        for (label, action) in actions {
            spawn_on(&handle, label, action);
        }
        count
    }

    /// Guard that releases the pending actions when dropped.
    pub fn release_on_drop(&self) -> ReleaseOnDrop {
        ReleaseOnDrop {
            deferred: self.clone(),
        }
    }
}

impl DeferredTrigger for AfterResponse {
    fn defer(&self, label: String, action: DeferredAction) {
        debug!(label = %label, "Deferred action registered");
        match self.pending.lock() {
            Ok(mut pending) => pending.push((label, action)),
            Err(poisoned) => poisoned.into_inner().push((label, action)),
        }
    }
}

/// Releases an [`AfterResponse`] when dropped.
pub struct ReleaseOnDrop {
    deferred: AfterResponse,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let started = self.deferred.release();
        if started > 0 {
            debug!(count = started, "Released deferred actions");
        }
    }
}

fn spawn_on(handle: &Handle, label: String, action: DeferredAction) {
    handle.spawn(async move {
        debug!(label = %label, "Deferred action started");
        action.await;
        debug!(label = %label, "Deferred action finished");
    });
}
