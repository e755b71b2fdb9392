//! Job creation helpers shared by the periodic sweeps and user-facing
//! endpoints.
//!
//! Jobs are always inserted as PENDING; the reconciler owns dispatch.
//! Creation nudges the reconciler so execution starts within seconds
//! instead of at the next 30 s tick.

use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use tracetune::model::{Job, JobResult, JobType};
use tracetune::{Error, Result, Store};
use tracetune_broker::TaskBroker;

use crate::gates::MAX_PENDING_JOBS_PER_PROMPT_AND_TYPE;
use crate::tasks;

/// Reason recorded on system jobs displaced by a user trigger.
pub const SUPERSEDED_REASON: &str = "Superseded by user-triggered job";

/// Everything needed to create one PENDING job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_type: JobType,
    pub project_id: Uuid,
    pub prompt_slug: Option<String>,
    /// `None` for scheduler-created jobs.
    pub user_id: Option<Uuid>,
    pub parameters: Map<String, Value>,
    pub validation_stats: Map<String, Value>,
}

impl JobRequest {
    #[must_use]
    pub fn system(job_type: JobType, project_id: Uuid, prompt_slug: Option<String>) -> Self {
        Self {
            job_type,
            project_id,
            prompt_slug,
            user_id: None,
            parameters: Map::new(),
            validation_stats: Map::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn stats(mut self, stats: Map<String, Value>) -> Self {
        self.validation_stats = stats;
        self
    }

    #[must_use]
    pub fn by_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Insert a PENDING job and nudge the reconciler.
///
/// User-triggered creation first cancels any PENDING system job for the
/// same scope (user intent wins); a RUNNING system job is left alone -
/// Phase B uniqueness delays the user job until it finishes. The
/// per-scope cap bounds how many jobs can pile up behind a slow one.
pub async fn create_job(
    store: &dyn Store,
    broker: &dyn TaskBroker,
    request: JobRequest,
) -> Result<Job> {
    if request.user_id.is_some() {
        let cancelled = store
            .cancel_pending_system_jobs(
                request.project_id,
                request.job_type,
                request.prompt_slug.as_deref(),
                SUPERSEDED_REASON,
            )
            .await?;
        if cancelled > 0 {
            info!(
                job_type = %request.job_type,
                cancelled,
                "cancelled system jobs superseded by user trigger"
            );
        }
    }

    let active = store
        .list_active_jobs(
            request.project_id,
            request.job_type,
            request.prompt_slug.as_deref(),
        )
        .await?;
    if active.len() >= MAX_PENDING_JOBS_PER_PROMPT_AND_TYPE {
        return Err(Error::DuplicateJob(format!(
            "{} jobs already pending or running for this scope (max {})",
            active.len(),
            MAX_PENDING_JOBS_PER_PROMPT_AND_TYPE
        )));
    }

    let mut job = Job::new(
        request.job_type,
        request.project_id,
        request.prompt_slug.clone(),
    )
    .with_result(JobResult {
        parameters: request.parameters,
        validation_stats: request.validation_stats,
        extra: Map::new(),
    });
    if let Some(user_id) = request.user_id {
        job = job.triggered_by(user_id);
    }

    store.insert_job(&job).await?;
    info!(job_id = %job.id, job_type = %job.job_type, "created pending job");

    // Best-effort: if the broker is down the 30 s reconciler tick covers
    // the gap.
    if let Err(err) = broker
        .send_task(tasks::RECONCILE_PENDING_JOBS, Value::Object(Map::new()))
        .await
    {
        warn!(error = %err, "failed to nudge reconciler");
    }

    Ok(job)
}
