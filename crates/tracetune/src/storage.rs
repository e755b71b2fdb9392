//! The persistence gateway seam.
//!
//! [`Store`] is the contract the orchestration engine programs against;
//! `tracetune-postgres` is the production backend and the in-memory
//! store (behind the `testing` feature) backs the test suites. All
//! methods take `&self`; backends are internally synchronized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    BacktestRun, Job, JobStatus, JobType, Prompt, Span, Suggestion,
};

/// Async transactional access to the relational store.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Projects ────────────────────────────────────────────────────────

    /// Ids of all active projects, the candidate scopes for discovery.
    async fn active_project_ids(&self) -> Result<Vec<Uuid>>;

    // ── Jobs ────────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Persist the current state of `job` (status, task id, result).
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// All jobs in `status`, ordered by `created_at` ascending.
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Jobs in {pending, running} for a (project, type) scope; when
    /// `prompt_slug` is given the slug must match too.
    async fn list_active_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
    ) -> Result<Vec<Job>>;

    /// Most recent jobs for a (project, type) scope regardless of
    /// status, newest first. The backtest gate reads the last run's
    /// `scored_count_at_creation` from here.
    async fn list_recent_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Cancel PENDING system-triggered jobs for the scope, recording the
    /// reason. Returns how many were cancelled.
    async fn cancel_pending_system_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
        reason: &str,
    ) -> Result<u64>;

    /// Delete terminal-state system jobs of the given types created
    /// before `cutoff`. User-triggered jobs are never deleted.
    async fn delete_old_system_jobs(
        &self,
        job_types: &[JobType],
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    // ── Prompts ─────────────────────────────────────────────────────────

    async fn insert_prompt(&self, prompt: &Prompt) -> Result<()>;

    /// Persist mutable prompt fields (criteria, descriptions, metadata,
    /// active flag) for an existing `(project, slug, version)` row.
    async fn update_prompt(&self, prompt: &Prompt) -> Result<()>;

    async fn get_prompt(
        &self,
        project_id: Uuid,
        slug: &str,
        version: i32,
    ) -> Result<Option<Prompt>>;

    /// Latest version for a slug.
    async fn find_latest_prompt(&self, project_id: Uuid, slug: &str) -> Result<Option<Prompt>>;

    /// The latest version of every slug in the project.
    async fn list_latest_prompts(&self, project_id: Uuid) -> Result<Vec<Prompt>>;

    /// Any version (at any slug) in the project with this content hash.
    async fn find_prompt_by_hash(&self, project_id: Uuid, hash: &str) -> Result<Option<Prompt>>;

    /// Highest existing version for a slug, 0 when the slug is new.
    async fn max_prompt_version(&self, project_id: Uuid, slug: &str) -> Result<i32>;

    /// Whether any version exists under this slug.
    async fn slug_exists(&self, project_id: Uuid, slug: &str) -> Result<bool>;

    /// Single transaction: deactivate every version of `(project, slug)`
    /// then activate `version`. Backing store for accept-suggestion.
    async fn set_active_version(&self, project_id: Uuid, slug: &str, version: i32) -> Result<()>;

    // ── Spans ───────────────────────────────────────────────────────────

    async fn insert_span(&self, span: &Span) -> Result<()>;

    async fn get_spans(&self, span_ids: &[String]) -> Result<Vec<Span>>;

    /// Total span count for the project (all operations).
    async fn count_spans(&self, project_id: Uuid) -> Result<i64>;

    /// Non-system spans with `prompt_id` unset.
    async fn list_unmapped_spans(&self, project_id: Uuid) -> Result<Vec<Span>>;

    /// Whether any span in the project has ever been mapped to a prompt.
    async fn any_mapped_spans(&self, project_id: Uuid) -> Result<bool>;

    /// Prompt-linked, non-system spans without a correctness score.
    async fn list_unscored_spans(&self, prompt_id: &str, limit: i64) -> Result<Vec<Span>>;

    async fn count_unscored_spans(&self, prompt_id: &str) -> Result<i64>;

    /// Prompt-linked, non-system spans carrying a correctness score.
    async fn list_scored_spans(&self, prompt_id: &str) -> Result<Vec<Span>>;

    async fn count_scored_spans(&self, prompt_id: &str) -> Result<i64>;

    /// Scored non-system spans across every version of the slug.
    async fn count_scored_spans_for_slug(&self, project_id: Uuid, slug: &str) -> Result<i64>;

    /// Non-system spans for the prompt started at or after `since`.
    async fn count_spans_for_prompt_since(
        &self,
        prompt_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Record a discovery mapping: prompt link + extracted variables.
    async fn set_span_mapping(
        &self,
        span_id: &str,
        prompt_id: &str,
        input_params: &Value,
    ) -> Result<()>;

    /// Merge a correctness score into `feedback_score`.
    async fn set_span_correctness(&self, span_id: &str, correctness: f64) -> Result<()>;

    // ── Suggestions ─────────────────────────────────────────────────────

    async fn insert_suggestion(&self, suggestion: &Suggestion) -> Result<()>;

    async fn get_suggestion(&self, id: Uuid) -> Result<Option<Suggestion>>;

    async fn update_suggestion(&self, suggestion: &Suggestion) -> Result<()>;

    // ── Backtest runs ───────────────────────────────────────────────────

    async fn insert_backtest_run(&self, run: &BacktestRun) -> Result<()>;

    async fn update_backtest_run(&self, run: &BacktestRun) -> Result<()>;

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Release pooled connections. Called at the end of every worker
    /// task so a forked child never inherits a live pool.
    async fn dispose(&self) -> Result<()>;
}
