//! Daily pruning of terminal-state system jobs.
//!
//! User-triggered jobs are never auto-deleted; they disappear only
//! when the user deletes them.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use tracetune::model::JobType;
use tracetune::{Result, Store};

/// Jobs older than this many hours are eligible for deletion.
pub const CLEANUP_AGE_HOURS: i64 = 24;

/// Delete completed/failed/cancelled system jobs older than the cutoff.
pub async fn cleanup_old_jobs(store: &dyn Store, older_than_hours: i64) -> Result<Value> {
    let cutoff = Utc::now() - Duration::hours(older_than_hours);
    let deleted = store
        .delete_old_system_jobs(&JobType::ALL, cutoff)
        .await?;

    if deleted == 0 {
        info!("job cleanup: nothing to delete");
    } else {
        info!(deleted, older_than_hours, "job cleanup finished");
    }
    Ok(json!({"deleted": deleted, "cutoff": cutoff.to_rfc3339()}))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use tracetune::model::{Job, JobStatus};
    use tracetune::testing::MemoryStore;
    use uuid::Uuid;

    fn terminal_job(age_hours: i64, user: Option<Uuid>, status: JobStatus) -> Job {
        let mut job = Job::new(JobType::JudgeScoring, Uuid::new_v4(), Some("s".into()));
        job.status = status;
        job.created_at = Utc::now() - Duration::hours(age_hours);
        job.triggered_by_user_id = user;
        job
    }

    #[tokio::test]
    async fn deletes_only_old_terminal_system_jobs() {
        let store = MemoryStore::new();

        let old_system = terminal_job(30, None, JobStatus::Completed);
        let old_failed = terminal_job(48, None, JobStatus::Failed);
        let old_user = terminal_job(30, Some(Uuid::new_v4()), JobStatus::Completed);
        let fresh_system = terminal_job(2, None, JobStatus::Cancelled);
        let mut old_running = terminal_job(30, None, JobStatus::Completed);
        old_running.status = JobStatus::Running;

        for job in [&old_system, &old_failed, &old_user, &fresh_system, &old_running] {
            store.insert_job(job).await.unwrap();
        }

        let result = cleanup_old_jobs(&store, CLEANUP_AGE_HOURS).await.unwrap();
        assert_eq!(result["deleted"], 2);

        // The user job, the fresh job, and the running job survive.
        assert!(store.get_job(old_user.id).await.unwrap().is_some());
        assert!(store.get_job(fresh_system.id).await.unwrap().is_some());
        assert!(store.get_job(old_running.id).await.unwrap().is_some());
        assert!(store.get_job(old_system.id).await.unwrap().is_none());
        assert!(store.get_job(old_failed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_store_reports_zero() {
        let store = MemoryStore::new();
        let result = cleanup_old_jobs(&store, CLEANUP_AGE_HOURS).await.unwrap();
        assert_eq!(result["deleted"], 0);
        assert!(result["cutoff"].as_str().is_some());
    }
}
