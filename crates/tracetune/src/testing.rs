//! Test utilities: an in-memory [`Store`] and a scripted [`LlmGateway`].
//!
//! Enabled with the `testing` feature so downstream crates can exercise
//! gates, the reconciler, and the workers without postgres or a
//! provider account.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::llm::{CallStats, LlmGateway, LlmRequest, LlmResponse};
use crate::locks::LockService;
use crate::model::{
    BacktestRun, Job, JobStatus, JobType, Prompt, Span, Suggestion,
};
use crate::storage::Store;

#[derive(Default)]
struct MemoryInner {
    projects: Vec<Uuid>,
    jobs: HashMap<Uuid, Job>,
    /// Keyed by (project, slug, version).
    prompts: HashMap<(Uuid, String, i32), Prompt>,
    spans: HashMap<String, Span>,
    suggestions: HashMap<Uuid, Suggestion>,
    backtest_runs: HashMap<Uuid, BacktestRun>,
}

/// In-memory store for tests and single-process experiments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project id so discovery sweeps see it.
    pub async fn add_project(&self, project_id: Uuid) {
        let mut inner = self.inner.write().await;
        if !inner.projects.contains(&project_id) {
            inner.projects.push(project_id);
        }
    }

    /// Seed a span directly.
    pub async fn add_span(&self, span: Span) {
        self.inner
            .write()
            .await
            .spans
            .insert(span.span_id.clone(), span);
    }

    /// Seed a prompt directly.
    pub async fn add_prompt(&self, prompt: Prompt) {
        let key = (prompt.project_id, prompt.slug.clone(), prompt.version);
        self.inner.write().await.prompts.insert(key, prompt);
    }

    /// Snapshot every stored span (assertion helper).
    pub async fn all_spans(&self) -> Vec<Span> {
        self.inner.read().await.spans.values().cloned().collect()
    }

    /// Snapshot every stored job (assertion helper).
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    /// Snapshot every stored suggestion (assertion helper).
    pub async fn all_suggestions(&self) -> Vec<Suggestion> {
        self.inner
            .read()
            .await
            .suggestions
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot every backtest run (assertion helper).
    pub async fn all_backtest_runs(&self) -> Vec<BacktestRun> {
        self.inner
            .read()
            .await
            .backtest_runs
            .values()
            .cloned()
            .collect()
    }
}

fn span_counts_for_prompt(span: &Span, prompt_id: &str) -> bool {
    span.prompt_id.as_deref() == Some(prompt_id) && !span.is_system_generated()
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_project_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.inner.read().await.projects.clone())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&job.id) {
            Some(existing) => {
                let mut updated = job.clone();
                updated.updated_at = Utc::now();
                *existing = updated;
                Ok(())
            }
            None => Err(Error::NotFound(format!("job {}", job.id))),
        }
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_active_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
    ) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                j.status.is_active()
                    && j.project_id == project_id
                    && j.job_type == job_type
                    && prompt_slug.map_or(true, |slug| j.prompt_slug.as_deref() == Some(slug))
            })
            .cloned()
            .collect())
    }

    async fn list_recent_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.project_id == project_id
                    && j.job_type == job_type
                    && prompt_slug.map_or(true, |slug| j.prompt_slug.as_deref() == Some(slug))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn cancel_pending_system_jobs(
        &self,
        project_id: Uuid,
        job_type: JobType,
        prompt_slug: Option<&str>,
        reason: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut cancelled = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Pending
                && job.project_id == project_id
                && job.job_type == job_type
                && job.triggered_by_user_id.is_none()
                && prompt_slug.map_or(true, |slug| job.prompt_slug.as_deref() == Some(slug))
            {
                job.status = JobStatus::Cancelled;
                job.result.set("reason", reason);
                job.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn delete_old_system_jobs(
        &self,
        job_types: &[JobType],
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal()
                && job_types.contains(&job.job_type)
                && job.created_at < cutoff
                && job.triggered_by_user_id.is_none())
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn insert_prompt(&self, prompt: &Prompt) -> Result<()> {
        let key = (prompt.project_id, prompt.slug.clone(), prompt.version);
        let mut inner = self.inner.write().await;
        if inner.prompts.contains_key(&key) {
            return Err(Error::Storage(format!(
                "duplicate prompt version {}/{}/{}",
                key.0, key.1, key.2
            )));
        }
        inner.prompts.insert(key, prompt.clone());
        Ok(())
    }

    async fn update_prompt(&self, prompt: &Prompt) -> Result<()> {
        let key = (prompt.project_id, prompt.slug.clone(), prompt.version);
        let mut inner = self.inner.write().await;
        match inner.prompts.get_mut(&key) {
            Some(existing) => {
                let mut updated = prompt.clone();
                updated.updated_at = Utc::now();
                *existing = updated;
                Ok(())
            }
            None => Err(Error::NotFound(format!("prompt {}", prompt.prompt_id()))),
        }
    }

    async fn get_prompt(
        &self,
        project_id: Uuid,
        slug: &str,
        version: i32,
    ) -> Result<Option<Prompt>> {
        let key = (project_id, slug.to_string(), version);
        Ok(self.inner.read().await.prompts.get(&key).cloned())
    }

    async fn find_latest_prompt(&self, project_id: Uuid, slug: &str) -> Result<Option<Prompt>> {
        let inner = self.inner.read().await;
        Ok(inner
            .prompts
            .values()
            .filter(|p| p.project_id == project_id && p.slug == slug)
            .max_by_key(|p| p.version)
            .cloned())
    }

    async fn list_latest_prompts(&self, project_id: Uuid) -> Result<Vec<Prompt>> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<&str, &Prompt> = HashMap::new();
        for prompt in inner.prompts.values() {
            if prompt.project_id != project_id {
                continue;
            }
            match latest.get(prompt.slug.as_str()) {
                Some(existing) if existing.version >= prompt.version => {}
                _ => {
                    latest.insert(prompt.slug.as_str(), prompt);
                }
            }
        }
        let mut prompts: Vec<Prompt> = latest.into_values().cloned().collect();
        prompts.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(prompts)
    }

    async fn find_prompt_by_hash(&self, project_id: Uuid, hash: &str) -> Result<Option<Prompt>> {
        let inner = self.inner.read().await;
        Ok(inner
            .prompts
            .values()
            .find(|p| p.project_id == project_id && p.content_hash == hash)
            .cloned())
    }

    async fn max_prompt_version(&self, project_id: Uuid, slug: &str) -> Result<i32> {
        let inner = self.inner.read().await;
        Ok(inner
            .prompts
            .values()
            .filter(|p| p.project_id == project_id && p.slug == slug)
            .map(|p| p.version)
            .max()
            .unwrap_or(0))
    }

    async fn slug_exists(&self, project_id: Uuid, slug: &str) -> Result<bool> {
        Ok(self.max_prompt_version(project_id, slug).await? > 0)
    }

    async fn set_active_version(&self, project_id: Uuid, slug: &str, version: i32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let mut found = false;
        for prompt in inner.prompts.values_mut() {
            if prompt.project_id == project_id && prompt.slug == slug {
                prompt.is_active = prompt.version == version;
                found |= prompt.is_active;
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "prompt {project_id}/{slug} v{version}"
            )))
        }
    }

    async fn insert_span(&self, span: &Span) -> Result<()> {
        self.inner
            .write()
            .await
            .spans
            .insert(span.span_id.clone(), span.clone());
        Ok(())
    }

    async fn get_spans(&self, span_ids: &[String]) -> Result<Vec<Span>> {
        let inner = self.inner.read().await;
        Ok(span_ids
            .iter()
            .filter_map(|id| inner.spans.get(id))
            .cloned()
            .collect())
    }

    async fn count_spans(&self, project_id: Uuid) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .spans
            .values()
            .filter(|s| s.project_id == project_id)
            .count() as i64)
    }

    async fn list_unmapped_spans(&self, project_id: Uuid) -> Result<Vec<Span>> {
        let inner = self.inner.read().await;
        let mut spans: Vec<Span> = inner
            .spans
            .values()
            .filter(|s| {
                s.project_id == project_id && s.prompt_id.is_none() && !s.is_system_generated()
            })
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.start_time_unix_nano);
        Ok(spans)
    }

    async fn any_mapped_spans(&self, project_id: Uuid) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .spans
            .values()
            .any(|s| s.project_id == project_id && s.prompt_id.is_some()))
    }

    async fn list_unscored_spans(&self, prompt_id: &str, limit: i64) -> Result<Vec<Span>> {
        let inner = self.inner.read().await;
        let mut spans: Vec<Span> = inner
            .spans
            .values()
            .filter(|s| span_counts_for_prompt(s, prompt_id) && !s.is_scored())
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.start_time_unix_nano);
        spans.truncate(limit.max(0) as usize);
        Ok(spans)
    }

    async fn count_unscored_spans(&self, prompt_id: &str) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .spans
            .values()
            .filter(|s| span_counts_for_prompt(s, prompt_id) && !s.is_scored())
            .count() as i64)
    }

    async fn list_scored_spans(&self, prompt_id: &str) -> Result<Vec<Span>> {
        let inner = self.inner.read().await;
        let mut spans: Vec<Span> = inner
            .spans
            .values()
            .filter(|s| span_counts_for_prompt(s, prompt_id) && s.is_scored())
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.start_time_unix_nano);
        Ok(spans)
    }

    async fn count_scored_spans(&self, prompt_id: &str) -> Result<i64> {
        Ok(self.list_scored_spans(prompt_id).await?.len() as i64)
    }

    async fn count_scored_spans_for_slug(&self, project_id: Uuid, slug: &str) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .spans
            .values()
            .filter(|s| {
                s.project_id == project_id
                    && s.is_scored()
                    && !s.is_system_generated()
                    && s.prompt_id.as_deref().map_or(false, |pid| {
                        crate::model::PromptId::parse(pid)
                            .map_or(false, |id| id.slug == slug && id.project_id == project_id)
                    })
            })
            .count() as i64)
    }

    async fn count_spans_for_prompt_since(
        &self,
        prompt_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .spans
            .values()
            .filter(|s| span_counts_for_prompt(s, prompt_id) && s.started_at() >= since)
            .count() as i64)
    }

    async fn set_span_mapping(
        &self,
        span_id: &str,
        prompt_id: &str,
        input_params: &Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.spans.get_mut(span_id) {
            Some(span) => {
                span.prompt_id = Some(prompt_id.to_string());
                span.input_params = input_params.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("span {span_id}"))),
        }
    }

    async fn set_span_correctness(&self, span_id: &str, correctness: f64) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.spans.get_mut(span_id) {
            Some(span) => {
                span.feedback_score.correctness = Some(correctness);
                Ok(())
            }
            None => Err(Error::NotFound(format!("span {span_id}"))),
        }
    }

    async fn insert_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        self.inner
            .write()
            .await
            .suggestions
            .insert(suggestion.id, suggestion.clone());
        Ok(())
    }

    async fn get_suggestion(&self, id: Uuid) -> Result<Option<Suggestion>> {
        Ok(self.inner.read().await.suggestions.get(&id).cloned())
    }

    async fn update_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.suggestions.get_mut(&suggestion.id) {
            Some(existing) => {
                let mut updated = suggestion.clone();
                updated.updated_at = Utc::now();
                *existing = updated;
                Ok(())
            }
            None => Err(Error::NotFound(format!("suggestion {}", suggestion.id))),
        }
    }

    async fn insert_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        self.inner
            .write()
            .await
            .backtest_runs
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn update_backtest_run(&self, run: &BacktestRun) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.backtest_runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("backtest run {}", run.id))),
        }
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// One scripted gateway reply.
#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    RateLimited(String),
    Error(String),
}

/// A scripted [`LlmGateway`].
///
/// Replies are consumed in push order; once the script is exhausted the
/// configurable default reply is returned. Every request is recorded
/// for assertions.
pub struct MockGateway {
    script: StdMutex<std::collections::VecDeque<MockReply>>,
    default_reply: StdMutex<MockReply>,
    /// Requests whose rendered text contains any of these always fail,
    /// regardless of the script. Gives deterministic per-item failures
    /// under concurrent fanout.
    fail_matching: StdMutex<Vec<String>>,
    calls: StdMutex<Vec<LlmRequest>>,
    stats: CallStats,
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: StdMutex::new(std::collections::VecDeque::new()),
            default_reply: StdMutex::new(MockReply::Text("ok".to_string())),
            fail_matching: StdMutex::new(Vec::new()),
            calls: StdMutex::new(Vec::new()),
            stats: CallStats {
                prompt_tokens: 100,
                completion_tokens: 20,
                response_ms: 42.0,
                response_cost: 0.0005,
            },
        }
    }

    /// Set the reply returned once the script runs out.
    #[must_use]
    pub fn with_default_text(self, content: impl Into<String>) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            *self.default_reply.lock().unwrap() = MockReply::Text(content.into());
        }
        self
    }

    /// Override the stats attached to successful replies.
    #[must_use]
    pub fn with_stats(mut self, stats: CallStats) -> Self {
        self.stats = stats;
        self
    }

    /// Queue a text reply.
    pub fn push_text(&self, content: impl Into<String>) {
        #[allow(clippy::unwrap_used)]
        self.script
            .lock()
            .unwrap()
            .push_back(MockReply::Text(content.into()));
    }

    /// Queue a non-rate-limit failure.
    pub fn push_error(&self, message: impl Into<String>) {
        #[allow(clippy::unwrap_used)]
        self.script
            .lock()
            .unwrap()
            .push_back(MockReply::Error(message.into()));
    }

    /// Always fail requests whose text contains `pattern`.
    pub fn fail_when_contains(&self, pattern: impl Into<String>) {
        #[allow(clippy::unwrap_used)]
        self.fail_matching.lock().unwrap().push(pattern.into());
    }

    /// Queue a rate-limit failure.
    pub fn push_rate_limited(&self, message: impl Into<String>) {
        #[allow(clippy::unwrap_used)]
        self.script
            .lock()
            .unwrap()
            .push_back(MockReply::RateLimited(message.into()));
    }

    /// Requests seen so far.
    pub fn recorded_calls(&self) -> Vec<LlmRequest> {
        #[allow(clippy::unwrap_used)]
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made.
    pub fn call_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse> {
        let rendered = serde_json::to_string(&request).unwrap_or_default();
        #[allow(clippy::unwrap_used)]
        self.calls.lock().unwrap().push(request);

        #[allow(clippy::unwrap_used)]
        let matched = self
            .fail_matching
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| rendered.contains(pattern.as_str()));
        if matched {
            return Err(Error::Llm("matched failure pattern".to_string()));
        }

        #[allow(clippy::unwrap_used)]
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.lock().unwrap().clone());

        match reply {
            MockReply::Text(content) => Ok(LlmResponse {
                content,
                stats: self.stats,
            }),
            MockReply::RateLimited(msg) => Err(Error::LlmRateLimited(msg)),
            MockReply::Error(msg) => Err(Error::Llm(msg)),
        }
    }
}

/// In-memory [`LockService`]: a set of held names, no TTL expiry.
#[derive(Default)]
pub struct MemoryLocks {
    held: StdMutex<std::collections::HashSet<String>>,
}

impl MemoryLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a lock is currently held (assertion helper).
    pub fn is_held(&self, name: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        self.held.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn acquire(&self, name: &str, _ttl: std::time::Duration) -> Result<bool> {
        #[allow(clippy::unwrap_used)]
        Ok(self.held.lock().unwrap().insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        self.held.lock().unwrap().remove(name);
        Ok(())
    }
}
