use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;

use stepchain_core::config::DuplicatePolicy;
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::RunStore;
use stepchain_core::types::{
    RunId, RunSnapshot, RunStatus, Scenario, StepSnapshot, MAX_LIST_LIMIT,
};

use crate::StoreOptions;

/// In-process run store.
///
/// Same conditional transitions as the SQLite store, all taken under one
/// lock. Only suitable when a single process serves every invocation.
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
    options: StoreOptions,
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, (u64, RunSnapshot)>,
    next_seq: u64,
}

impl MemoryRunStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            options,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| StepchainError::Database(e.to_string()))
    }

    fn create(&self, scenario: Scenario, id: RunId, strict: bool) -> Result<RunSnapshot> {
        let mut state = self.lock()?;
        if let Some((_, existing)) = state.runs.get(&id) {
            if strict && self.options.on_duplicate == DuplicatePolicy::Reject {
                return Err(StepchainError::DuplicateId(id.0));
            }
            return Ok(existing.clone());
        }

        let run = RunSnapshot {
            id: id.clone(),
            scenario,
            status: RunStatus::Pending,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            steps: (1..=self.options.total_steps).map(StepSnapshot::pending).collect(),
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.runs.insert(id, (seq, run.clone()));
        Ok(run)
    }

    fn with_run<T>(
        &self,
        id: &RunId,
        f: impl FnOnce(&mut RunSnapshot) -> T,
    ) -> Result<Option<T>> {
        let mut state = self.lock()?;
        Ok(state.runs.get_mut(id).map(|(_, run)| f(run)))
    }
}

impl RunStore for MemoryRunStore {
    fn create_run(&self, scenario: Scenario, id: Option<RunId>) -> BoxFuture<'_, Result<RunSnapshot>> {
        let id = id.unwrap_or_default();
        Box::pin(async move { self.create(scenario, id, true) })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSnapshot>>> {
        let id = id.clone();
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state.runs.get(&id).map(|(_, run)| run.clone()))
        })
    }

    fn get_or_create_run(&self, id: &RunId, scenario: Scenario) -> BoxFuture<'_, Result<RunSnapshot>> {
        let id = id.clone();
        Box::pin(async move { self.create(scenario, id, false) })
    }

    fn list_runs(
        &self,
        limit: usize,
        scenario: Option<Scenario>,
    ) -> BoxFuture<'_, Result<Vec<RunSnapshot>>> {
        Box::pin(async move {
            let state = self.lock()?;
            let mut runs: Vec<&(u64, RunSnapshot)> = state
                .runs
                .values()
                .filter(|(_, run)| scenario.map_or(true, |s| run.scenario == s))
                .collect();
            runs.sort_by(|a, b| {
                b.1.started_at
                    .cmp(&a.1.started_at)
                    .then_with(|| b.0.cmp(&a.0))
            });
            Ok(runs
                .into_iter()
                .take(limit.min(MAX_LIST_LIMIT))
                .map(|(_, run)| run.clone())
                .collect())
        })
    }

    fn mark_step_ongoing(&self, id: &RunId, step: u32) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let applied = self.with_run(&id, |run| {
                if run.is_terminal() {
                    return false;
                }
                let Some(target) = run.steps.iter_mut().find(|s| s.step == step) else {
                    return false;
                };
                if target.status != RunStatus::Pending {
                    return false;
                }
                target.status = RunStatus::Ongoing;
                target.started_at = Some(Utc::now());
                target.completed_at = None;
                target.duration_ms = None;
                target.error = None;
                run.status = RunStatus::Ongoing;
                run.error = None;
                run.completed_at = None;
                true
            })?;
            Ok(applied.unwrap_or(false))
        })
    }

    fn mark_step_complete(&self, id: &RunId, step: u32, duration_ms: u64) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let applied = self.with_run(&id, |run| {
                if run.is_terminal() {
                    return false;
                }
                match run.steps.iter_mut().find(|s| s.step == step) {
                    Some(target) if target.status == RunStatus::Ongoing => {
                        target.status = RunStatus::Completed;
                        target.duration_ms = Some(duration_ms);
                        target.completed_at = Some(Utc::now());
                        target.error = None;
                        true
                    }
                    _ => false,
                }
            })?;
            Ok(applied.unwrap_or(false))
        })
    }

    fn mark_run_complete(&self, id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let applied = self.with_run(&id, |run| {
                if run.is_terminal() {
                    return false;
                }
                run.status = RunStatus::Completed;
                run.completed_at = Some(Utc::now());
                run.error = None;
                true
            })?;
            Ok(applied.unwrap_or(false))
        })
    }

    fn mark_run_failed(&self, id: &RunId, message: &str, step: Option<u32>) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        let message = message.to_string();
        Box::pin(async move {
            let found = self.with_run(&id, |run| {
                let now = Utc::now();
                if let Some(target) = step.and_then(|n| run.steps.iter_mut().find(|s| s.step == n)) {
                    target.status = RunStatus::Failed;
                    target.error = Some(message.clone());
                    target.completed_at = Some(now);
                }
                run.status = RunStatus::Failed;
                run.error = Some(message);
                run.completed_at = Some(now);
            })?;
            found.ok_or_else(|| StepchainError::RunNotFound(id.0.clone()))
        })
    }

    fn kill_run(&self, id: &RunId, message: &str) -> BoxFuture<'_, Result<Option<RunSnapshot>>> {
        let id = id.clone();
        let message = message.to_string();
        Box::pin(async move {
            self.with_run(&id, |run| {
                if run.is_terminal() {
                    return run.clone();
                }
                let now = Utc::now();
                for step in run.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                    step.status = RunStatus::Failed;
                    step.error = Some(message.clone());
                    step.completed_at = Some(now);
                }
                run.status = RunStatus::Failed;
                run.error = Some(message);
                run.completed_at = Some(now);
                run.clone()
            })
        })
    }
}
