//! Worker handlers and their shared lifecycle contract.
//!
//! Every handler runs through [`run_job`]: load the row, take
//! ownership by flipping it to RUNNING, execute the type-specific
//! body, classify the outcome into a terminal state in one update, and
//! dispose the store's pooled connections on every exit path. If the
//! body is interrupted and leaves no terminal status, the safety net
//! marks the job failed rather than leaving a silent RUNNING row.

pub mod backtest;
pub mod describe;
pub mod discovery;
pub mod judge;
pub mod replay;
pub mod tuning;

use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use tracetune::model::{Job, JobStatus};
use tracetune::{Error, Result, Store};

/// Reason recorded when a worker was cancelled mid-flight.
pub const INTERRUPTED_REASON: &str = "cancelled or interrupted";

/// What a worker body produced.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub status: JobStatus,
    /// Refinement like `no_improvement`, surfaced as `status_detail`.
    pub detail: Option<String>,
    /// Type-specific output fields merged into `job.result`.
    pub output: Map<String, Value>,
}

impl WorkerOutcome {
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            detail: None,
            output: Map::new(),
        }
    }

    #[must_use]
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status,
            detail: None,
            output: Map::new(),
        }
    }

    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(JobStatus::Cancelled);
        outcome
            .output
            .insert("reason".into(), Value::String(reason.into()));
        outcome
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.output.insert(key.to_string(), value.into());
        self
    }
}

/// The partial-completion rule shared by judge scoring and
/// backtesting: all failed -> failed, some failed ->
/// partially_completed, none failed -> completed.
#[must_use]
pub fn classify_partial(success_count: usize, total_units: usize) -> JobStatus {
    if total_units == 0 || success_count == 0 {
        JobStatus::Failed
    } else if success_count < total_units {
        JobStatus::PartiallyCompleted
    } else {
        JobStatus::Completed
    }
}

/// Run a worker body under the shared lifecycle contract.
///
/// Returns the JSON payload recorded as the broker task result. Errors
/// are re-raised after the row is marked failed so the broker records
/// FAILURE too.
pub async fn run_job<F, Fut>(
    store: &dyn Store,
    job_id: Uuid,
    task_id: &str,
    body: F,
) -> Result<Value>
where
    F: FnOnce(Job) -> Fut,
    Fut: std::future::Future<Output = Result<WorkerOutcome>>,
{
    let result = execute(store, job_id, task_id, body).await;

    // Dispose on every exit path so a forked worker process never
    // inherits live pooled connections.
    if let Err(err) = store.dispose().await {
        warn!(error = %err, "engine dispose failed");
    }

    result
}

async fn execute<F, Fut>(
    store: &dyn Store,
    job_id: Uuid,
    task_id: &str,
    body: F,
) -> Result<Value>
where
    F: FnOnce(Job) -> Fut,
    Fut: std::future::Future<Output = Result<WorkerOutcome>>,
{
    let mut job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;

    match job.status {
        JobStatus::Cancelled => {
            info!(job_id = %job_id, "job cancelled before execution");
            return Ok(serde_json::json!({"status": "cancelled"}));
        }
        JobStatus::Pending => {
            // Dispatched around the reconciler (user trigger during a
            // tick race): take ownership here.
            job.status = JobStatus::Running;
            job.task_id = Some(task_id.to_string());
            store.update_job(&job).await?;
        }
        JobStatus::Running => {
            if job.task_id.is_none() {
                job.task_id = Some(task_id.to_string());
                store.update_job(&job).await?;
            }
        }
        status => {
            // Already terminal: a duplicate delivery, nothing to do.
            info!(job_id = %job_id, %status, "job already terminal");
            return Ok(serde_json::json!({"status": status.as_str()}));
        }
    }

    match body(job.clone()).await {
        Ok(outcome) => {
            // Safety net: a body that returns a non-terminal status was
            // interrupted; never leave the row running.
            let (status, detail) = if outcome.status.is_terminal() {
                (outcome.status, outcome.detail)
            } else {
                warn!(job_id = %job_id, "worker body returned non-terminal status");
                (JobStatus::Failed, Some(INTERRUPTED_REASON.to_string()))
            };

            job.status = status;
            for (key, value) in outcome.output {
                job.result.extra.insert(key, value);
            }
            if let Some(detail) = detail {
                job.result.set("status_detail", detail);
            }
            store.update_job(&job).await?;

            let mut payload = Map::new();
            payload.insert("status".into(), Value::String(status.as_str().into()));
            for (key, value) in &job.result.extra {
                payload.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(payload))
        }
        Err(err) => {
            error!(job_id = %job_id, error = %err, "worker failed");
            job.status = JobStatus::Failed;
            job.result.set("error", err.to_string());
            store.update_job(&job).await?;
            Err(err)
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use tracetune::model::JobType;
    use tracetune::testing::MemoryStore;

    #[test]
    fn partial_completion_rule() {
        assert_eq!(classify_partial(0, 10), JobStatus::Failed);
        assert_eq!(classify_partial(0, 0), JobStatus::Failed);
        assert_eq!(classify_partial(3, 10), JobStatus::PartiallyCompleted);
        assert_eq!(classify_partial(10, 10), JobStatus::Completed);
    }

    #[tokio::test]
    async fn pending_job_is_taken_over_and_completed() {
        let store = MemoryStore::new();
        let job = Job::new(JobType::JudgeScoring, Uuid::new_v4(), Some("s".into()));
        store.insert_job(&job).await.unwrap();

        let payload = run_job(&store, job.id, "task-1", |_job| async {
            Ok(WorkerOutcome::completed().field("spans_evaluated", 10))
        })
        .await
        .unwrap();

        assert_eq!(payload["status"], "completed");
        assert_eq!(payload["spans_evaluated"], 10);
        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert_eq!(after.task_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn cancelled_job_returns_without_running_body() {
        let store = MemoryStore::new();
        let mut job = Job::new(JobType::PromptTuning, Uuid::new_v4(), Some("s".into()));
        job.status = JobStatus::Cancelled;
        store.insert_job(&job).await.unwrap();

        let payload = run_job(&store, job.id, "task-1", |_job| async {
            panic!("body must not run for cancelled jobs");
            #[allow(unreachable_code)]
            Ok(WorkerOutcome::completed())
        })
        .await
        .unwrap();
        assert_eq!(payload["status"], "cancelled");
    }

    #[tokio::test]
    async fn body_error_marks_job_failed_and_reraises() {
        let store = MemoryStore::new();
        let job = Job::new(JobType::JudgeScoring, Uuid::new_v4(), Some("s".into()));
        store.insert_job(&job).await.unwrap();

        let err = run_job(&store, job.id, "task-1", |_job| async {
            Err(Error::Llm("provider down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("provider down"));

        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert!(after
            .result
            .get("error")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("provider down"));
    }

    #[tokio::test]
    async fn non_terminal_body_status_trips_the_safety_net() {
        let store = MemoryStore::new();
        let job = Job::new(JobType::JudgeScoring, Uuid::new_v4(), Some("s".into()));
        store.insert_job(&job).await.unwrap();

        run_job(&store, job.id, "task-1", |_job| async {
            Ok(WorkerOutcome::with_status(JobStatus::Running))
        })
        .await
        .unwrap();

        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(
            after.result.get("status_detail").unwrap(),
            INTERRUPTED_REASON
        );
    }

    #[tokio::test]
    async fn missing_job_is_an_error() {
        let store = MemoryStore::new();
        let err = run_job(&store, Uuid::new_v4(), "task-1", |_job| async {
            Ok(WorkerOutcome::completed())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn worker_cancelled_outcome_is_terminal() {
        let store = MemoryStore::new();
        let job = Job::new(JobType::PromptTuning, Uuid::new_v4(), Some("s".into()));
        store.insert_job(&job).await.unwrap();

        run_job(&store, job.id, "task-1", |_job| async {
            Ok(WorkerOutcome::cancelled("identical to existing version"))
        })
        .await
        .unwrap();

        let after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(
            after.result.get("reason").unwrap(),
            "identical to existing version"
        );
    }
}
