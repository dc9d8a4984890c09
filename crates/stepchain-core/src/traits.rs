use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{RunId, RunSnapshot, Scenario, StepResult};

/// System of record for runs and their steps.
///
/// Every `mark_*` transition is conditioned on the current status inside one
/// transaction. A `false` return means the precondition no longer held
/// (typically a concurrent kill) and nothing was written.
pub trait RunStore: Send + Sync + 'static {
    /// Create a run with every step `pending`. `None` generates an id.
    fn create_run(&self, scenario: Scenario, id: Option<RunId>) -> BoxFuture<'_, Result<RunSnapshot>>;

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSnapshot>>>;

    /// Return the run if it exists, otherwise create it.
    fn get_or_create_run(&self, id: &RunId, scenario: Scenario) -> BoxFuture<'_, Result<RunSnapshot>>;

    /// Newest first, at most `limit` (capped at `MAX_LIST_LIMIT`).
    fn list_runs(
        &self,
        limit: usize,
        scenario: Option<Scenario>,
    ) -> BoxFuture<'_, Result<Vec<RunSnapshot>>>;

    /// Run -> `ongoing` (from `pending`/`ongoing`) and step `pending` -> `ongoing`,
    /// atomically. A step that is already running is refused.
    fn mark_step_ongoing(&self, id: &RunId, step: u32) -> BoxFuture<'_, Result<bool>>;

    /// Step `ongoing` -> `completed` while the run is still live.
    fn mark_step_complete(&self, id: &RunId, step: u32, duration_ms: u64) -> BoxFuture<'_, Result<bool>>;

    /// Run `pending`/`ongoing` -> `completed`.
    fn mark_run_complete(&self, id: &RunId) -> BoxFuture<'_, Result<bool>>;

    /// Force the run, and the named step, to `failed`.
    fn mark_run_failed(&self, id: &RunId, message: &str, step: Option<u32>) -> BoxFuture<'_, Result<()>>;

    /// Fail the run and every non-terminal step. Terminal runs come back unchanged.
    fn kill_run(&self, id: &RunId, message: &str) -> BoxFuture<'_, Result<Option<RunSnapshot>>>;
}

/// The unit of work behind one step.
pub trait StepExecutor: Send + Sync + 'static {
    /// Run `step` for `duration`. Fails with `Aborted` if `cancel` fires first.
    fn execute(
        &self,
        step: u32,
        duration: Duration,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'_, Result<StepResult>>;
}

/// Reaches the next invocation of a chained run.
pub trait StepDispatcher: Send + Sync + 'static {
    /// Invoke `step` of `run_id` as a fresh request. Non-success is a `Dispatch` error.
    fn dispatch_step(&self, run_id: &RunId, step: u32) -> BoxFuture<'_, Result<()>>;

    /// Liveness notification.
    fn ping(&self, source: &str) -> BoxFuture<'_, Result<()>> {
        let _ = source;
        Box::pin(async { Ok(()) })
    }
}
