use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::StepExecutor;
use stepchain_core::types::StepResult;

/// Placeholder unit of work: waits out the step's duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedExecutor;

impl StepExecutor for SimulatedExecutor {
    fn execute(
        &self,
        step: u32,
        duration: Duration,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'_, Result<StepResult>> {
        Box::pin(async move {
            let started = Instant::now();
            match cancel {
                Some(token) => {
                    if token.is_cancelled() {
                        return Err(StepchainError::Aborted);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = token.cancelled() => return Err(StepchainError::Aborted),
                    }
                }
                None => tokio::time::sleep(duration).await,
            }
            Ok(StepResult::complete(step, started.elapsed().as_millis() as u64))
        })
    }
}

/// Who finished first in a race between a step and its deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceOutcome {
    Finished(StepResult),
    TimedOut,
}

/// Run `step` against `deadline`. When the deadline wins the executor's
/// cancellation token fires so its local wait ends promptly.
pub async fn race_step(
    executor: &dyn StepExecutor,
    step: u32,
    duration: Duration,
    deadline: Instant,
) -> Result<RaceOutcome> {
    let token = CancellationToken::new();
    let work = executor.execute(step, duration, Some(token.clone()));
    tokio::select! {
        result = work => result.map(RaceOutcome::Finished),
        _ = tokio::time::sleep_until(deadline) => {
            token.cancel();
            Ok(RaceOutcome::TimedOut)
        }
    }
}

/// Render milliseconds the way timeout messages print them.
pub fn format_ms(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
