//! Per-invocation state machine for the chained scenario.
//!
//! validate -> load run -> precondition check -> mark ongoing -> execute
//! -> persist -> schedule continuation -> respond.
//!
//! The controller never trusts its own view of the run across an await
//! point: every transition goes through a conditional store call, and a
//! refused transition is reported as `aborted` rather than as an error.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use stepchain_core::config::ChainedConfig;
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::{RunStore, StepDispatcher, StepExecutor};
use stepchain_core::types::{RunId, RunSnapshot, RunStatus, Scenario, StepResult};

use crate::continuation::{continuation_action, fail_quietly, ping_action};
use crate::deferred::{DeferredAction, DeferredTrigger};
use crate::executor::{format_ms, race_step, RaceOutcome};

/// What one step invocation reports back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StepOutcome {
    /// Work finished and was persisted within this invocation.
    #[serde(rename = "complete")]
    Completed {
        run_id: RunId,
        step: u32,
        result: StepResult,
        run: RunSnapshot,
    },
    /// Step marked ongoing; work runs after the response.
    Accepted { run_id: RunId, step: u32 },
    AlreadyCompleted {
        run_id: RunId,
        step: u32,
        duration_ms: Option<u64>,
        run: RunSnapshot,
    },
    /// Another delivery of this step is still executing it.
    InProgress {
        run_id: RunId,
        step: u32,
        run: RunSnapshot,
    },
    /// The run was terminal before, or became terminal during, this invocation.
    Aborted {
        run_id: RunId,
        step: u32,
        message: String,
        run: Option<RunSnapshot>,
    },
    RaceTimeout {
        run_id: RunId,
        step: u32,
        message: String,
        run: Option<RunSnapshot>,
    },
    Failed {
        run_id: RunId,
        step: u32,
        error: String,
    },
}

impl StepOutcome {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Completed { run_id, .. }
            | Self::Accepted { run_id, .. }
            | Self::AlreadyCompleted { run_id, .. }
            | Self::InProgress { run_id, .. }
            | Self::Aborted { run_id, .. }
            | Self::RaceTimeout { run_id, .. }
            | Self::Failed { run_id, .. } => run_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "complete",
            Self::Accepted { .. } => "accepted",
            Self::AlreadyCompleted { .. } => "already_completed",
            Self::InProgress { .. } => "in_progress",
            Self::Aborted { .. } => "aborted",
            Self::RaceTimeout { .. } => "race_timeout",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Parse a path segment into a step number within `1..=total`.
pub fn parse_step(raw: &str, total: u32) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(step) if (1..=total).contains(&step) => Ok(step),
        _ => Err(StepchainError::InvalidStep {
            step: raw.to_string(),
            total,
        }),
    }
}

#[derive(Clone)]
pub struct StepController {
    store: Arc<dyn RunStore>,
    executor: Arc<dyn StepExecutor>,
    dispatcher: Arc<dyn StepDispatcher>,
    config: Arc<ChainedConfig>,
    total_steps: u32,
}

impl StepController {
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn StepExecutor>,
        dispatcher: Arc<dyn StepDispatcher>,
        config: ChainedConfig,
        total_steps: u32,
    ) -> Self {
        Self {
            store,
            executor,
            dispatcher,
            config: Arc::new(config),
            total_steps,
        }
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// Handle one invocation of `step`. Continuations and side effects are
    /// handed to `trigger`; nothing scheduled there is awaited here.
    pub async fn handle(
        &self,
        step: u32,
        requested: Option<RunId>,
        trigger: &dyn DeferredTrigger,
    ) -> Result<StepOutcome> {
        if !(1..=self.total_steps).contains(&step) {
            return Err(StepchainError::InvalidStep {
                step: step.to_string(),
                total: self.total_steps,
            });
        }

        let run = match requested {
            Some(id) => self.store.get_or_create_run(&id, Scenario::Chained).await?,
            None => {
                self.store
                    .create_run(Scenario::Chained, Some(RunId::new()))
                    .await?
            }
        };
        let run_id = run.id.clone();

        if run.scenario != Scenario::Chained {
            return Err(StepchainError::ScenarioMismatch {
                run_id: run_id.0.clone(),
            });
        }
        let Some(current) = run.step(step) else {
            return Err(StepchainError::StepNotInRun {
                run_id: run_id.0.clone(),
                step,
            });
        };

        // Replay of a finished step reports the stored result, even when
        // the run has since been killed.
        if current.status == RunStatus::Completed {
            debug!(run_id = %run_id, step, "Step already completed");
            return Ok(StepOutcome::AlreadyCompleted {
                run_id,
                step,
                duration_ms: current.duration_ms,
                run,
            });
        }
        if run.is_terminal() {
            info!(run_id = %run_id, step, status = %run.status, "Run already terminal");
            return Ok(aborted(run_id, step, Some(run)));
        }

        if !self.store.mark_step_ongoing(&run_id, step).await? {
            return self.start_refused(run_id, step).await;
        }
        info!(run_id = %run_id, step, "Step ongoing");

        if self.config.is_deferred_step(step) {
            let controller = self.clone();
            let id = run_id.clone();
            trigger.defer(
                format!("step {} of {}", step, run_id),
                Box::pin(async move { controller.run_deferred(id, step).await }),
            );
            return Ok(StepOutcome::Accepted { run_id, step });
        }

        let outcome = match self.execute_and_persist(&run_id, step).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %run_id, step, error = %e, "Step failed");
                let message = format!("Step {} failed: {}", step, e);
                fail_quietly(self.store.as_ref(), &run_id, &message, Some(step)).await;
                return Err(e);
            }
        };
        if matches!(outcome, StepOutcome::Completed { .. }) {
            for (label, action) in self.follow_ups(&run_id, step) {
                trigger.defer(label, action);
            }
        }
        Ok(outcome)
    }

    /// `mark_step_ongoing` said no: the run went terminal, or another
    /// delivery of this step got there first.
    async fn start_refused(&self, run_id: RunId, step: u32) -> Result<StepOutcome> {
        let run = self.store.get_run(&run_id).await?;
        let current = run.as_ref().and_then(|r| r.step(step)).map(|s| s.status);
        match (run, current) {
            (Some(run), Some(RunStatus::Completed)) => {
                debug!(run_id = %run_id, step, "Step completed by another delivery");
                let duration_ms = run.step(step).and_then(|s| s.duration_ms);
                Ok(StepOutcome::AlreadyCompleted {
                    run_id,
                    step,
                    duration_ms,
                    run,
                })
            }
            (Some(run), Some(RunStatus::Ongoing)) if !run.is_terminal() => {
                info!(run_id = %run_id, step, "Step already running, duplicate delivery ignored");
                Ok(StepOutcome::InProgress { run_id, step, run })
            }
            (run, _) => {
                info!(run_id = %run_id, step, "Run terminated before step started");
                Ok(aborted(run_id, step, run))
            }
        }
    }

    /// Body of a 202-answered step: the work, then its follow-ups in parallel.
    async fn run_deferred(self, run_id: RunId, step: u32) {
        let outcome = match self.execute_and_persist(&run_id, step).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %run_id, step, error = %e, "Deferred step failed");
                let message = format!("Step {} failed: {}", step, e);
                fail_quietly(self.store.as_ref(), &run_id, &message, Some(step)).await;
                return;
            }
        };
        debug!(run_id = %run_id, step, outcome = outcome.kind(), "Deferred step finished");

        if matches!(outcome, StepOutcome::Completed { .. }) {
            let follow_ups = self.follow_ups(&run_id, step);
            join_all(follow_ups.into_iter().map(|(_, action)| action)).await;
        }
    }

    async fn execute_and_persist(&self, run_id: &RunId, step: u32) -> Result<StepOutcome> {
        let duration = self.config.step_duration(step);
        let result = if self.config.is_race_step(step) {
            let deadline = Instant::now() + self.config.race_timeout();
            match race_step(self.executor.as_ref(), step, duration, deadline).await {
                Ok(RaceOutcome::Finished(result)) => Ok(result),
                Ok(RaceOutcome::TimedOut) => return self.record_race_timeout(run_id, step).await,
                Err(e) => Err(e),
            }
        } else {
            self.executor.execute(step, duration, None).await
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                if let Some(outcome) = self.abort_if_terminal(run_id, step).await? {
                    return Ok(outcome);
                }
                let message = e.to_string();
                error!(run_id = %run_id, step, error = %message, "Step execution failed");
                fail_quietly(self.store.as_ref(), run_id, &message, Some(step)).await;
                return Ok(StepOutcome::Failed {
                    run_id: run_id.clone(),
                    step,
                    error: message,
                });
            }
        };

        if let Some(outcome) = self.abort_if_terminal(run_id, step).await? {
            info!(run_id = %run_id, step, "Discarding result of killed run");
            return Ok(outcome);
        }
        if !self
            .store
            .mark_step_complete(run_id, step, result.duration_ms)
            .await?
        {
            info!(run_id = %run_id, step, "Step completion refused");
            let run = self.store.get_run(run_id).await?;
            return Ok(aborted(run_id.clone(), step, run));
        }
        info!(run_id = %run_id, step, duration_ms = result.duration_ms, "Step completed");

        if step == self.total_steps {
            if !self.store.mark_run_complete(run_id).await? {
                let run = self.store.get_run(run_id).await?;
                return Ok(aborted(run_id.clone(), step, run));
            }
            info!(run_id = %run_id, "Run completed");
        } else if let Some(outcome) = self.abort_if_terminal(run_id, step).await? {
            return Ok(outcome);
        }

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StepchainError::RunNotFound(run_id.0.clone()))?;
        Ok(StepOutcome::Completed {
            run_id: run_id.clone(),
            step,
            result,
            run,
        })
    }

    async fn record_race_timeout(&self, run_id: &RunId, step: u32) -> Result<StepOutcome> {
        if let Some(outcome) = self.abort_if_terminal(run_id, step).await? {
            return Ok(outcome);
        }
        let message = format!(
            "Step {} exceeded the {} race timeout and was stopped before the {} execution budget.",
            step,
            format_ms(self.config.race_timeout_ms),
            format_ms(self.config.execution_budget_ms),
        );
        warn!(run_id = %run_id, step, "Race timeout");
        fail_quietly(self.store.as_ref(), run_id, &message, Some(step)).await;
        let run = self.store.get_run(run_id).await?;
        Ok(StepOutcome::RaceTimeout {
            run_id: run_id.clone(),
            step,
            message,
            run,
        })
    }

    /// Live-status re-check. `Some` means the run went terminal under us.
    async fn abort_if_terminal(&self, run_id: &RunId, step: u32) -> Result<Option<StepOutcome>> {
        let run = self.store.get_run(run_id).await?;
        match run {
            Some(run) if !run.is_terminal() => Ok(None),
            run => Ok(Some(aborted(run_id.clone(), step, run))),
        }
    }

    /// Deferred actions that follow a persisted completion of `step`.
    fn follow_ups(&self, run_id: &RunId, step: u32) -> Vec<(String, DeferredAction)> {
        let mut actions = Vec::new();
        if step < self.total_steps {
            let next = step + 1;
            actions.push((
                format!("continue {} to step {}", run_id, next),
                continuation_action(
                    self.store.clone(),
                    self.dispatcher.clone(),
                    run_id.clone(),
                    next,
                ),
            ));
        } else {
            actions.push((
                format!("audit {}", run_id),
                audit_action(self.store.clone(), run_id.clone()),
            ));
        }
        if self.config.notify_ping {
            actions.push((
                format!("ping after step {}", step),
                ping_action(self.dispatcher.clone(), format!("chained-step-{}", step)),
            ));
        }
        actions
    }
}

fn aborted(run_id: RunId, step: u32, run: Option<RunSnapshot>) -> StepOutcome {
    let message = match &run {
        Some(run) => run
            .error
            .clone()
            .unwrap_or_else(|| format!("Run is already {}.", run.status)),
        None => "Run no longer exists.".to_string(),
    };
    StepOutcome::Aborted {
        run_id,
        step,
        message,
        run,
    }
}

fn audit_action(store: Arc<dyn RunStore>, run_id: RunId) -> DeferredAction {
    Box::pin(async move {
        match store.get_run(&run_id).await {
            Ok(Some(run)) => {
                let total_ms: u64 = run.steps.iter().filter_map(|s| s.duration_ms).sum();
                info!(
                    run_id = %run_id,
                    status = %run.status,
                    steps = run.steps.len(),
                    total_ms,
                    "Run audit"
                );
            }
            Ok(None) => warn!(run_id = %run_id, "Run vanished before audit"),
            Err(e) => error!(run_id = %run_id, error = %e, "Run audit failed"),
        }
    })
}
