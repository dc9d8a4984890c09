//! Behaviour every `RunStore` backend must share.

use std::sync::Arc;

use stepchain_core::error::StepchainError;
use stepchain_core::traits::RunStore;
use stepchain_core::types::{RunId, RunStatus, Scenario};

pub async fn run_all(store: &dyn RunStore) {
    create_starts_all_steps_pending(store).await;
    duplicate_create_returns_existing(store).await;
    get_or_create_is_idempotent(store).await;
    full_walk_completes_run(store).await;
    complete_requires_ongoing_step(store).await;
    ongoing_step_is_not_restarted(store).await;
    kill_blocks_later_transitions(store).await;
    kill_is_idempotent(store).await;
    kill_unknown_run_is_none(store).await;
    mark_failed_names_step(store).await;
    list_is_newest_first_and_bounded(store).await;
}

async fn create_starts_all_steps_pending(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Chained, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.scenario, Scenario::Chained);
    assert_eq!(run.steps.len(), 4);
    assert!(run.completed_at.is_none());
    for (idx, step) in run.steps.iter().enumerate() {
        assert_eq!(step.step, idx as u32 + 1);
        assert_eq!(step.status, RunStatus::Pending);
        assert!(step.duration_ms.is_none());
    }
}

async fn duplicate_create_returns_existing(store: &dyn RunStore) {
    let id = RunId::from_string("dup-create");
    let first = store.create_run(Scenario::Chained, Some(id.clone())).await.unwrap();
    assert!(store.mark_step_ongoing(&id, 1).await.unwrap());

    let second = store.create_run(Scenario::Sequential, Some(id.clone())).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.scenario, Scenario::Chained);
    assert_eq!(second.status, RunStatus::Ongoing);
}

async fn get_or_create_is_idempotent(store: &dyn RunStore) {
    let id = RunId::from_string("goc");
    assert!(store.get_run(&id).await.unwrap().is_none());

    let created = store.get_or_create_run(&id, Scenario::Chained).await.unwrap();
    let again = store.get_or_create_run(&id, Scenario::Race).await.unwrap();
    assert_eq!(created, again);
    assert_eq!(again.scenario, Scenario::Chained);
}

async fn full_walk_completes_run(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Chained, None).await.unwrap();
    for step in 1..=4 {
        assert!(store.mark_step_ongoing(&run.id, step).await.unwrap());
        let mid = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(mid.status, RunStatus::Ongoing);
        assert_eq!(mid.step(step).unwrap().status, RunStatus::Ongoing);
        assert!(mid.step(step).unwrap().started_at.is_some());
        assert!(store.mark_step_complete(&run.id, step, 10 * step as u64).await.unwrap());
    }
    assert!(store.mark_run_complete(&run.id).await.unwrap());

    let done = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());
    for step in &done.steps {
        assert_eq!(step.status, RunStatus::Completed);
        assert_eq!(step.duration_ms, Some(10 * step.step as u64));
    }

    // Completed runs are absorbing.
    assert!(!store.mark_step_ongoing(&run.id, 1).await.unwrap());
    assert!(!store.mark_run_complete(&run.id).await.unwrap());
}

async fn complete_requires_ongoing_step(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Chained, None).await.unwrap();
    assert!(!store.mark_step_complete(&run.id, 2, 5).await.unwrap());

    assert!(store.mark_step_ongoing(&run.id, 2).await.unwrap());
    assert!(store.mark_step_complete(&run.id, 2, 5).await.unwrap());
    // A second completion is refused and the first duration stays.
    assert!(!store.mark_step_complete(&run.id, 2, 99).await.unwrap());
    // A completed step never goes back to ongoing.
    assert!(!store.mark_step_ongoing(&run.id, 2).await.unwrap());

    let run = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.step(2).unwrap().duration_ms, Some(5));
    assert!(!store.mark_step_ongoing(&run.id, 42).await.unwrap());
}

async fn ongoing_step_is_not_restarted(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Chained, None).await.unwrap();
    assert!(store.mark_step_ongoing(&run.id, 1).await.unwrap());
    let first = store.get_run(&run.id).await.unwrap().unwrap();

    // A second delivery of the same step must not start it again.
    assert!(!store.mark_step_ongoing(&run.id, 1).await.unwrap());
    let second = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(second, first);
    assert_eq!(second.step(1).unwrap().started_at, first.step(1).unwrap().started_at);

    assert!(store.mark_step_complete(&run.id, 1, 3).await.unwrap());
}

async fn kill_blocks_later_transitions(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Chained, None).await.unwrap();
    assert!(store.mark_step_ongoing(&run.id, 1).await.unwrap());
    assert!(store.mark_step_complete(&run.id, 1, 7).await.unwrap());
    assert!(store.mark_step_ongoing(&run.id, 2).await.unwrap());

    let killed = store.kill_run(&run.id, "stop").await.unwrap().unwrap();
    assert_eq!(killed.status, RunStatus::Failed);
    assert_eq!(killed.error.as_deref(), Some("stop"));
    assert!(killed.completed_at.is_some());
    assert_eq!(killed.step(1).unwrap().status, RunStatus::Completed);
    assert_eq!(killed.step(1).unwrap().duration_ms, Some(7));
    assert!(killed.step(1).unwrap().error.is_none());
    for n in 2..=4 {
        let step = killed.step(n).unwrap();
        assert_eq!(step.status, RunStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("stop"));
    }

    assert!(!store.mark_step_complete(&run.id, 2, 9).await.unwrap());
    assert!(!store.mark_step_ongoing(&run.id, 3).await.unwrap());
    assert!(!store.mark_run_complete(&run.id).await.unwrap());
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap(),
        killed,
        "refused transitions must not write"
    );
}

async fn kill_is_idempotent(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Sequential, None).await.unwrap();
    assert!(store.mark_step_ongoing(&run.id, 1).await.unwrap());

    let first = store.kill_run(&run.id, "first").await.unwrap().unwrap();
    let second = store.kill_run(&run.id, "second").await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(second.error.as_deref(), Some("first"));

    let completed = store.create_run(Scenario::Chained, None).await.unwrap();
    assert!(store.mark_run_complete(&completed.id).await.unwrap());
    let untouched = store.kill_run(&completed.id, "late").await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Completed);
    assert!(untouched.error.is_none());
}

async fn kill_unknown_run_is_none(store: &dyn RunStore) {
    let missing = RunId::from_string("never-created");
    assert!(store.kill_run(&missing, "x").await.unwrap().is_none());
    assert!(!store.mark_step_ongoing(&missing, 1).await.unwrap());
    assert!(!store.mark_run_complete(&missing).await.unwrap());
}

async fn mark_failed_names_step(store: &dyn RunStore) {
    let run = store.create_run(Scenario::Race, None).await.unwrap();
    assert!(store.mark_step_ongoing(&run.id, 1).await.unwrap());
    store.mark_run_failed(&run.id, "boom", Some(1)).await.unwrap();

    let failed = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("boom"));
    assert_eq!(failed.step(1).unwrap().status, RunStatus::Failed);
    assert_eq!(failed.step(1).unwrap().error.as_deref(), Some("boom"));
    assert_eq!(failed.step(2).unwrap().status, RunStatus::Pending);

    // Repeated calls overwrite the terminal record.
    store.mark_run_failed(&run.id, "boom again", None).await.unwrap();
    let failed = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(failed.error.as_deref(), Some("boom again"));

    let err = store
        .mark_run_failed(&RunId::from_string("ghost"), "x", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StepchainError::RunNotFound(_)));
}

async fn list_is_newest_first_and_bounded(store: &dyn RunStore) {
    for _ in 0..3 {
        store.create_run(Scenario::Race, None).await.unwrap();
    }
    let newest = store.create_run(Scenario::Race, None).await.unwrap();

    let all = store.list_runs(100, None).await.unwrap();
    assert!(all.len() >= 4);
    for pair in all.windows(2) {
        assert!(pair[0].started_at >= pair[1].started_at);
    }

    let races = store.list_runs(2, Some(Scenario::Race)).await.unwrap();
    assert_eq!(races.len(), 2);
    assert_eq!(races[0].id, newest.id);
    assert!(races.iter().all(|r| r.scenario == Scenario::Race));

    let capped = store.list_runs(10_000, None).await.unwrap();
    assert!(capped.len() <= 100);
}

pub async fn reject_duplicate(store: &dyn RunStore) {
    let id = RunId::from_string("strict");
    let run = store.create_run(Scenario::Chained, Some(id.clone())).await.unwrap();
    assert_eq!(run.steps.len(), 2);

    let err = store.create_run(Scenario::Chained, Some(id.clone())).await.unwrap_err();
    assert!(matches!(err, StepchainError::DuplicateId(ref dup) if dup == "strict"));

    // get_or_create stays idempotent regardless of policy.
    let again = store.get_or_create_run(&id, Scenario::Chained).await.unwrap();
    assert_eq!(again.id, id);
}

/// A kill and a natural completion on the same step: exactly one wins.
pub async fn kill_races_completion<S: RunStore>(store: Arc<S>) {
    for round in 0..25 {
        let run = store.create_run(Scenario::Chained, None).await.unwrap();
        assert!(store.mark_step_ongoing(&run.id, 1).await.unwrap());

        let completer = {
            let store = store.clone();
            let id = run.id.clone();
            tokio::spawn(async move { store.mark_step_complete(&id, 1, round).await.unwrap() })
        };
        let killer = {
            let store = store.clone();
            let id = run.id.clone();
            tokio::spawn(async move { store.kill_run(&id, "kill switch").await.unwrap() })
        };

        let completed = completer.await.unwrap();
        killer.await.unwrap().unwrap();

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let step = run.step(1).unwrap();
        if completed {
            assert_eq!(step.status, RunStatus::Completed);
            assert_eq!(step.duration_ms, Some(round));
        } else {
            assert_eq!(step.status, RunStatus::Failed);
            assert_eq!(step.error.as_deref(), Some("kill switch"));
        }
    }
}
