use std::sync::Arc;

use stepchain_core::config::AppConfig;
use stepchain_core::traits::{RunStore, StepDispatcher, StepExecutor};
use stepchain_engine::{RunLifecycle, SequentialRunner, StepController};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: AppConfig,
    pub controller: StepController,
    pub sequential: SequentialRunner,
    pub lifecycle: RunLifecycle,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn StepExecutor>,
        dispatcher: Arc<dyn StepDispatcher>,
    ) -> Self {
        let total_steps = config.runs.total_steps;
        Self {
            controller: StepController::new(
                store.clone(),
                executor.clone(),
                dispatcher,
                config.chained.clone(),
                total_steps,
            ),
            sequential: SequentialRunner::new(
                store.clone(),
                executor,
                config.sequential.clone(),
                total_steps,
            ),
            lifecycle: RunLifecycle::new(store, config.runs.clone()),
            config,
        }
    }
}
