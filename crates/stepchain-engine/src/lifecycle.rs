use std::sync::Arc;

use tracing::info;

use stepchain_core::config::RunsConfig;
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::RunStore;
use stepchain_core::types::{RunId, RunSnapshot, Scenario, MAX_LIST_LIMIT};

/// Status, listing, and kill switch for runs of any scenario.
#[derive(Clone)]
pub struct RunLifecycle {
    store: Arc<dyn RunStore>,
    config: RunsConfig,
}

impl RunLifecycle {
    pub fn new(store: Arc<dyn RunStore>, config: RunsConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_status(&self, run_id: Option<&str>) -> Result<RunSnapshot> {
        let run_id = match run_id.map(str::trim) {
            Some(id) if !id.is_empty() => RunId::from_string(id),
            _ => return Err(StepchainError::MissingParameter("runId".into())),
        };
        self.store
            .get_run(&run_id)
            .await?
            .ok_or(StepchainError::RunNotFound(run_id.0))
    }

    /// `limit` falls back to the default when absent or unparsable and is
    /// clamped to `[1, list_max_limit]`. A blank `scenario` means no filter.
    pub async fn list_runs(
        &self,
        limit: Option<&str>,
        scenario: Option<&str>,
    ) -> Result<Vec<RunSnapshot>> {
        let limit = self.effective_limit(limit);
        let scenario = match scenario.map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<Scenario>()?),
            _ => None,
        };
        self.store.list_runs(limit, scenario).await
    }

    pub fn effective_limit(&self, raw: Option<&str>) -> usize {
        let max = self.config.list_max_limit.min(MAX_LIST_LIMIT).max(1);
        raw.and_then(|s| s.trim().parse::<i64>().ok())
            .map(|n| n.clamp(1, max as i64) as usize)
            .unwrap_or_else(|| self.config.list_default_limit.clamp(1, max))
    }

    /// Force the run to `failed`. Already-terminal runs come back unchanged.
    pub async fn kill(&self, run_id: &str, message: Option<&str>) -> Result<RunSnapshot> {
        let message = message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.kill_message.as_str())
            .to_string();
        let id = RunId::from_string(run_id);
        let run = self
            .store
            .kill_run(&id, &message)
            .await?
            .ok_or_else(|| StepchainError::RunNotFound(run_id.to_string()))?;
        info!(run_id = %id, status = %run.status, message = %message, "Kill switch");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepchain_core::types::RunStatus;
    use stepchain_store::{MemoryRunStore, StoreOptions};

    fn lifecycle() -> (Arc<dyn RunStore>, RunLifecycle) {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new(StoreOptions::default()));
        (store.clone(), RunLifecycle::new(store, RunsConfig::default()))
    }

    #[tokio::test]
    async fn test_status_requires_run_id() {
        let (_, lifecycle) = lifecycle();
        for missing in [None, Some(""), Some("  ")] {
            let err = lifecycle.get_status(missing).await.unwrap_err();
            assert!(matches!(err, StepchainError::MissingParameter(ref p) if p == "runId"));
        }
        let err = lifecycle.get_status(Some("nope")).await.unwrap_err();
        assert!(matches!(err, StepchainError::RunNotFound(_)));
    }

    #[test]
    fn test_limit_parsing() {
        let (_, lifecycle) = lifecycle();
        assert_eq!(lifecycle.effective_limit(None), 20);
        assert_eq!(lifecycle.effective_limit(Some("abc")), 20);
        assert_eq!(lifecycle.effective_limit(Some("0")), 1);
        assert_eq!(lifecycle.effective_limit(Some("-5")), 1);
        assert_eq!(lifecycle.effective_limit(Some("7")), 7);
        assert_eq!(lifecycle.effective_limit(Some("5000")), 100);
    }

    #[tokio::test]
    async fn test_list_filters_by_scenario() {
        let (store, lifecycle) = lifecycle();
        store.create_run(Scenario::Chained, None).await.unwrap();
        store.create_run(Scenario::Race, None).await.unwrap();

        let races = lifecycle.list_runs(None, Some("RACE")).await.unwrap();
        assert_eq!(races.len(), 1);
        assert_eq!(lifecycle.list_runs(None, Some("")).await.unwrap().len(), 2);

        let err = lifecycle.list_runs(None, Some("batch")).await.unwrap_err();
        assert!(err.is_input_error());
    }

    #[tokio::test]
    async fn test_kill_defaults_blank_message() {
        let (store, lifecycle) = lifecycle();
        let run = store.create_run(Scenario::Chained, None).await.unwrap();

        let killed = lifecycle.kill(run.id.as_str(), Some("   ")).await.unwrap();
        assert_eq!(killed.status, RunStatus::Failed);
        assert_eq!(killed.error.as_deref(), Some("Manually stopped via kill switch."));

        let again = lifecycle.kill(run.id.as_str(), Some("other")).await.unwrap();
        assert_eq!(again, killed);
    }

    #[tokio::test]
    async fn test_kill_trims_message_and_rejects_unknown() {
        let (store, lifecycle) = lifecycle();
        let run = store.create_run(Scenario::Sequential, None).await.unwrap();
        let killed = lifecycle.kill(run.id.as_str(), Some("  halt  ")).await.unwrap();
        assert_eq!(killed.error.as_deref(), Some("halt"));

        let err = lifecycle.kill("missing", None).await.unwrap_err();
        assert!(matches!(err, StepchainError::RunNotFound(ref id) if id == "missing"));
    }
}
