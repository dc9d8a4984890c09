use std::sync::Arc;

use tracing::{debug, error, info, warn};

use stepchain_core::error::StepchainError;
use stepchain_core::traits::{RunStore, StepDispatcher};
use stepchain_core::types::RunId;

use crate::deferred::DeferredAction;

/// Start `next_step` of a chained run. A failed start is written to the
/// store against `next_step`, since nobody is waiting on this call.
pub async fn trigger_step(
    store: Arc<dyn RunStore>,
    dispatcher: Arc<dyn StepDispatcher>,
    run_id: RunId,
    next_step: u32,
) {
    info!(run_id = %run_id, step = next_step, "Triggering next step");
    let err = match dispatcher.dispatch_step(&run_id, next_step).await {
        Ok(()) => return,
        Err(err) => err,
    };

    let message = match &err {
        StepchainError::Dispatch {
            status: Some(status),
            ..
        } => format!("Step {} failed to start (HTTP {}).", next_step, status),
        _ => format!("Step {} failed to start after previous completion.", next_step),
    };
    error!(run_id = %run_id, step = next_step, error = %err, "Continuation failed");
    fail_quietly(store.as_ref(), &run_id, &message, Some(next_step)).await;
}

/// Deferred form of [`trigger_step`].
pub fn continuation_action(
    store: Arc<dyn RunStore>,
    dispatcher: Arc<dyn StepDispatcher>,
    run_id: RunId,
    next_step: u32,
) -> DeferredAction {
    Box::pin(trigger_step(store, dispatcher, run_id, next_step))
}

/// Liveness ping; failures are only logged.
pub async fn ping(dispatcher: Arc<dyn StepDispatcher>, source: String) {
    if let Err(e) = dispatcher.ping(&source).await {
        warn!(source = %source, error = %e, "Ping failed");
    }
}

pub fn ping_action(dispatcher: Arc<dyn StepDispatcher>, source: String) -> DeferredAction {
    Box::pin(ping(dispatcher, source))
}

/// Record a failure against a live run, logging instead of propagating if
/// the store refuses. A run that is already terminal keeps its outcome.
pub async fn fail_quietly(store: &dyn RunStore, run_id: &RunId, message: &str, step: Option<u32>) {
    match store.get_run(run_id).await {
        Ok(Some(run)) if run.is_terminal() => {
            debug!(run_id = %run_id, status = %run.status, "Run already terminal, failure not recorded");
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(run_id = %run_id, "Run vanished before its failure was recorded");
            return;
        }
        // Still try the write; the read may have been the only thing failing.
        Err(e) => warn!(run_id = %run_id, error = %e, "Run lookup failed before recording failure"),
    }
    if let Err(e) = store.mark_run_failed(run_id, message, step).await {
        error!(run_id = %run_id, step = ?step, error = %e, "Failed to persist run failure");
    }
}
