//! Fakes and fixtures shared by the stepchain test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use stepchain_core::config::{AppConfig, IN_MEMORY_STORE};
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::{StepDispatcher, StepExecutor};
use stepchain_core::types::{RunId, StepResult};

/// Config with millisecond step durations, an in-memory store, and no race
/// steps, so whole chains finish well inside a test timeout.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.path = IN_MEMORY_STORE.to_string();
    config.runs.total_steps = 4;

    config.chained.step_durations_ms = vec![10; 4];
    config.chained.default_step_duration_ms = 10;
    config.chained.race_steps = Vec::new();
    config.chained.race_timeout_ms = 2_000;
    config.chained.notify_ping = true;
    config.chained.dispatch_timeout_secs = 2;

    config.sequential.step_duration_ms = 10;
    config.sequential.execution_budget_ms = 2_000;
    config.sequential.race_timeout_ms = 2_000;
    config.sequential.kill_poll_ms = 5;
    config
}

/// Executor whose behaviour is set per step: extra delay, or failure.
///
/// Steps without a scripted delay wait the duration they are asked for.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    delays: HashMap<u32, Duration>,
    failing: Vec<u32>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedExecutor {
    pub fn with_delay(mut self, step: u32, delay: Duration) -> Self {
        self.delays.insert(step, delay);
        self
    }

    pub fn failing_on(mut self, step: u32) -> Self {
        self.failing.push(step);
        self
    }

    /// Steps executed so far, in call order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(
        &self,
        step: u32,
        duration: Duration,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'_, Result<StepResult>> {
        let wait = self.delays.get(&step).copied().unwrap_or(duration);
        let fails = self.failing.contains(&step);
        self.calls.lock().unwrap().push(step);

        Box::pin(async move {
            let started = Instant::now();
            let token = cancel.unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = token.cancelled() => return Err(StepchainError::Aborted),
            }
            if fails {
                return Err(StepchainError::Executor(format!("scripted failure in step {}", step)));
            }
            Ok(StepResult::complete(step, started.elapsed().as_millis() as u64))
        })
    }
}

/// Dispatcher that only records what it was asked to do.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    dispatched: Arc<Mutex<Vec<(RunId, u32)>>>,
    pings: Arc<Mutex<Vec<String>>>,
    fail_pings: bool,
}

impl RecordingDispatcher {
    /// Pings are still recorded but report failure.
    pub fn failing_pings(mut self) -> Self {
        self.fail_pings = true;
        self
    }

    pub fn dispatched(&self) -> Vec<(RunId, u32)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn pings(&self) -> Vec<String> {
        self.pings.lock().unwrap().clone()
    }

    /// Poll until at least `count` dispatches were recorded. Panics after 2s.
    pub async fn wait_for_dispatches(&self, count: usize) {
        for _ in 0..400 {
            if self.dispatched.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} dispatches, saw {:?}",
            count,
            self.dispatched()
        );
    }

    /// Poll until at least `count` pings were recorded. Panics after 2s.
    pub async fn wait_for_pings(&self, count: usize) {
        for _ in 0..400 {
            if self.pings.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pings, saw {:?}", count, self.pings());
    }
}

impl StepDispatcher for RecordingDispatcher {
    fn dispatch_step(&self, run_id: &RunId, step: u32) -> BoxFuture<'_, Result<()>> {
        self.dispatched.lock().unwrap().push((run_id.clone(), step));
        Box::pin(async { Ok(()) })
    }

    fn ping(&self, source: &str) -> BoxFuture<'_, Result<()>> {
        self.pings.lock().unwrap().push(source.to_string());
        let fails = self.fail_pings;
        Box::pin(async move {
            if fails {
                return Err(StepchainError::Executor("scripted ping failure".into()));
            }
            Ok(())
        })
    }
}

/// Dispatcher that never reaches the next step.
#[derive(Debug, Clone, Copy)]
pub struct FailingDispatcher {
    status: Option<u16>,
}

impl FailingDispatcher {
    /// The next step answered with a non-success status.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
        }
    }

    /// The request never got an answer.
    pub fn unreachable() -> Self {
        Self { status: None }
    }
}

impl StepDispatcher for FailingDispatcher {
    fn dispatch_step(&self, _run_id: &RunId, step: u32) -> BoxFuture<'_, Result<()>> {
        let status = self.status;
        Box::pin(async move {
            Err(StepchainError::Dispatch {
                step,
                status,
                message: "scripted dispatch failure".into(),
            })
        })
    }

    fn ping(&self, _source: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(StepchainError::Executor("scripted ping failure".into())) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_config_is_valid() {
        let config = fast_config();
        config.validate().unwrap();
        assert!(config.store_path().is_none());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let executor = ScriptedExecutor::default().failing_on(2);
        executor.execute(1, Duration::from_millis(1), None).await.unwrap();
        let err = executor
            .execute(2, Duration::from_millis(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StepchainError::Executor(_)));
        assert_eq!(executor.calls(), vec![1, 2]);
    }
}
