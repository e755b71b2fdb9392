//! The job reconciler: the only component that moves PENDING jobs to
//! RUNNING, and the authority that closes out stale RUNNING rows.
//!
//! Phase A sweeps RUNNING jobs whose broker-side task already finished
//! without the worker updating the row (worker crashes, lost
//! callbacks). Phase B dispatches PENDING jobs FIFO, gating each on
//! per-(type, scope) uniqueness against workers that are actually
//! alive on the broker side.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use tracetune::locks::{with_lock, LockOutcome, LockService};
use tracetune::model::{Job, JobStatus};
use tracetune::{Result, Store};
use tracetune_broker::{TaskBroker, TaskState};

use crate::tasks;

/// Lock name guarding reconciler runs.
pub const RECONCILER_LOCK: &str = "job_reconciler";

/// What one reconciler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub stale_cleaned: u64,
    pub jobs_executed: u64,
    pub skipped_duplicates: u64,
    pub dispatch_failures: u64,
}

impl ReconcileStats {
    /// Stats as the JSON payload recorded on the broker task.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "stale_cleaned": self.stale_cleaned,
            "jobs_executed": self.jobs_executed,
            "skipped_duplicates": self.skipped_duplicates,
            "dispatch_failures": self.dispatch_failures,
        })
    }
}

/// Run both phases under the reconciler's single-flight lock.
/// Overlapping invocations collapse into one.
pub async fn reconcile(
    store: &dyn Store,
    broker: &dyn TaskBroker,
    locks: &dyn LockService,
) -> Result<LockOutcome<ReconcileStats>> {
    with_lock(locks, RECONCILER_LOCK, || async {
        let stale_cleaned = cleanup_stale_running(store, broker).await?;
        let (jobs_executed, skipped_duplicates, dispatch_failures) =
            dispatch_pending(store, broker).await?;
        let stats = ReconcileStats {
            stale_cleaned,
            jobs_executed,
            skipped_duplicates,
            dispatch_failures,
        };
        if stats != ReconcileStats::default() {
            info!(
                stale = stats.stale_cleaned,
                executed = stats.jobs_executed,
                skipped = stats.skipped_duplicates,
                "reconciler run finished"
            );
        }
        Ok(stats)
    })
    .await
}

/// Phase A: close out RUNNING rows whose broker task already
/// terminated. Lookup errors leave the row alone - the next tick
/// retries.
pub async fn cleanup_stale_running(store: &dyn Store, broker: &dyn TaskBroker) -> Result<u64> {
    let running = store.list_jobs_by_status(JobStatus::Running).await?;
    let mut cleaned = 0;

    for mut job in running {
        let Some(task_id) = job.task_id.clone() else {
            continue;
        };
        let outcome = match broker.task_state(&task_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "could not check broker state");
                continue;
            }
        };

        match outcome.state {
            TaskState::Success => {
                job.status = JobStatus::Completed;
                match outcome.result {
                    Some(Value::Object(map)) => {
                        for (k, v) in map {
                            job.result.extra.insert(k, v);
                        }
                    }
                    Some(other) => {
                        job.result.set("raw", other.to_string());
                    }
                    None => {}
                }
                store.update_job(&job).await?;
                cleaned += 1;
            }
            TaskState::Failure | TaskState::Revoked => {
                job.status = JobStatus::Failed;
                job.result.set(
                    "error",
                    outcome.error.unwrap_or_else(|| "task failed".to_string()),
                );
                store.update_job(&job).await?;
                cleaned += 1;
            }
            // PENDING / STARTED / RETRY: the worker may still finish.
            TaskState::Pending | TaskState::Started | TaskState::Retry => {}
        }
    }

    Ok(cleaned)
}

/// Phase B: dispatch PENDING jobs in `created_at` order.
/// Returns (executed, skipped_duplicates, dispatch_failures).
async fn dispatch_pending(
    store: &dyn Store,
    broker: &dyn TaskBroker,
) -> Result<(u64, u64, u64)> {
    let pending = store.list_jobs_by_status(JobStatus::Pending).await?;
    if pending.is_empty() {
        return Ok((0, 0, 0));
    }

    let running = store.list_jobs_by_status(JobStatus::Running).await?;
    let mut executed = 0;
    let mut skipped = 0;
    let mut failures = 0;
    // Scopes dispatched in this run - a second pending job for the same
    // scope waits for the next tick.
    let mut dispatched_scopes: HashSet<String> = HashSet::new();

    for mut job in pending {
        let scope = scope_key(&job);

        if dispatched_scopes.contains(&scope) {
            skipped += 1;
            continue;
        }

        if has_live_duplicate(&job, &running, broker).await {
            skipped += 1;
            continue;
        }

        let mut params = Value::Object(job.result.parameters.clone());
        params["job_id"] = Value::String(job.id.to_string());

        let task_name = tasks::worker_task_for(&job);
        match broker.send_task(task_name, params).await {
            Ok(task_id) => {
                job.status = JobStatus::Running;
                job.task_id = Some(task_id);
                store.update_job(&job).await?;
                dispatched_scopes.insert(scope);
                executed += 1;
                debug!(job_id = %job.id, task = task_name, "dispatched pending job");
            }
            Err(err) => {
                // Leave the row pending; the next tick retries.
                warn!(job_id = %job.id, error = %err, "dispatch failed");
                failures += 1;
            }
        }
    }

    Ok((executed, skipped, failures))
}

fn scope_key(job: &Job) -> String {
    match (&job.prompt_slug, job.job_type.is_per_prompt()) {
        (Some(slug), true) => format!("{}:{}:{}", job.job_type, job.project_id, slug),
        _ => format!("{}:{}", job.job_type, job.project_id),
    }
}

/// A same-scope RUNNING job blocks dispatch only while its broker task
/// is actually live; a terminal task means the row is stale and Phase A
/// will sweep it next tick.
async fn has_live_duplicate(job: &Job, running: &[Job], broker: &dyn TaskBroker) -> bool {
    for candidate in running.iter().filter(|r| r.same_scope(job)) {
        let Some(task_id) = candidate.task_id.as_deref() else {
            // No handle to check: assume live rather than double-dispatch.
            return true;
        };
        match broker.task_state(task_id).await {
            Ok(outcome) if outcome.state.is_live() => return true,
            Ok(_) => {}
            Err(_) => return true,
        }
    }
    false
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracetune::model::JobType;
    use tracetune::testing::{MemoryLocks, MemoryStore};
    use tracetune_broker::{InProcessBroker, TaskOutcome};
    use uuid::Uuid;

    fn pending_judge_job(project: Uuid, slug: &str) -> Job {
        let mut job = Job::new(JobType::JudgeScoring, project, Some(slug.to_string()));
        job.result
            .parameters
            .insert("prompt_id".into(), json!(format!("{project}_1_{slug}")));
        job
    }

    fn broker_with_noop_workers() -> InProcessBroker {
        let broker = InProcessBroker::new();
        for name in [
            tasks::RUN_AGENT_DISCOVERY,
            tasks::EVALUATE_PROMPT_SPANS,
            tasks::EVALUATE_SPANS,
            tasks::IMPROVE_SINGLE_PROMPT,
            tasks::RUN_MODEL_BACKTESTING,
        ] {
            broker.register(name, |_ctx| async { Ok(json!({})) });
        }
        broker
    }

    #[tokio::test]
    async fn dispatches_pending_job_and_flips_to_running() {
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();

        let job = pending_judge_job(Uuid::new_v4(), "checkout");
        store.insert_job(&job).await.unwrap();

        let stats = reconcile(&store, &broker, &locks)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(stats.jobs_executed, 1);

        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.task_id.is_some());
    }

    #[tokio::test]
    async fn skips_candidate_with_live_same_scope_runner() {
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();
        let project = Uuid::new_v4();

        let mut running = pending_judge_job(project, "same-prompt");
        running.status = JobStatus::Running;
        running.task_id = Some("running-task-1".to_string());
        store.insert_job(&running).await.unwrap();
        broker.override_state(
            "running-task-1",
            TaskOutcome {
                state: TaskState::Started,
                result: None,
                error: None,
            },
        );

        let pending = pending_judge_job(project, "same-prompt");
        store.insert_job(&pending).await.unwrap();

        let stats = reconcile(&store, &broker, &locks)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(stats.jobs_executed, 0);
        assert_eq!(stats.skipped_duplicates, 1);
        assert_eq!(
            store.get_job(pending.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn reclaims_crashed_worker_without_double_dispatch() {
        // A RUNNING job whose broker task reports FAILURE flips to
        // failed with the error, and no duplicate dispatch happens in
        // the same tick.
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();
        let project = Uuid::new_v4();

        let mut crashed = pending_judge_job(project, "checkout");
        crashed.status = JobStatus::Running;
        crashed.task_id = Some("dead-task-99".to_string());
        store.insert_job(&crashed).await.unwrap();
        broker.override_state(
            "dead-task-99",
            TaskOutcome {
                state: TaskState::Failure,
                result: None,
                error: Some("worker lost".to_string()),
            },
        );

        let stats = reconcile(&store, &broker, &locks)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(stats.stale_cleaned, 1);
        assert_eq!(stats.jobs_executed, 0);

        let after = store.get_job(crashed.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert!(after
            .result
            .get("error")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("worker lost"));
    }

    #[tokio::test]
    async fn successful_broker_task_completes_stale_row() {
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();

        let mut stale = pending_judge_job(Uuid::new_v4(), "checkout");
        stale.status = JobStatus::Running;
        stale.task_id = Some("done-task".to_string());
        store.insert_job(&stale).await.unwrap();
        broker.override_state(
            "done-task",
            TaskOutcome {
                state: TaskState::Success,
                result: Some(json!({"spans_evaluated": 10})),
                error: None,
            },
        );

        reconcile(&store, &broker, &locks).await.unwrap();

        let after = store.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.result.get("spans_evaluated").unwrap(), 10);
    }

    #[tokio::test]
    async fn two_pending_same_scope_dispatch_once_per_tick() {
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();
        let project = Uuid::new_v4();

        store
            .insert_job(&pending_judge_job(project, "checkout"))
            .await
            .unwrap();
        store
            .insert_job(&pending_judge_job(project, "checkout"))
            .await
            .unwrap();

        let stats = reconcile(&store, &broker, &locks)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(stats.jobs_executed, 1);
        assert_eq!(stats.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn reconciler_lock_collapses_overlapping_runs() {
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();
        assert!(locks
            .acquire(RECONCILER_LOCK, std::time::Duration::from_secs(60))
            .await
            .unwrap());

        let outcome = reconcile(&store, &broker, &locks).await.unwrap();
        assert_eq!(outcome, LockOutcome::Skipped);
    }

    #[tokio::test]
    async fn unknown_broker_state_counts_as_live() {
        // A RUNNING row with no task id cannot be probed; dispatching a
        // duplicate would be worse than waiting.
        let store = MemoryStore::new();
        let broker = broker_with_noop_workers();
        let locks = MemoryLocks::new();
        let project = Uuid::new_v4();

        let mut opaque = pending_judge_job(project, "checkout");
        opaque.status = JobStatus::Running;
        opaque.task_id = None;
        store.insert_job(&opaque).await.unwrap();
        store
            .insert_job(&pending_judge_job(project, "checkout"))
            .await
            .unwrap();

        let stats = reconcile(&store, &broker, &locks)
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(stats.jobs_executed, 0);
        assert_eq!(stats.skipped_duplicates, 1);
    }
}
