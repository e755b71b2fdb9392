//! Periodic sweep bodies: enumerate candidate scopes, run the gate,
//! insert PENDING jobs.
//!
//! Sweeps never dispatch work themselves - that is the reconciler's
//! job. Each sweep returns a stats map recorded as the tick's task
//! result.

use serde_json::{json, Value};
use tracing::{debug, info};

use tracetune::model::JobType;
use tracetune::{Result, Store};
use tracetune_broker::TaskBroker;

use crate::gates::{
    agent_discovery_gate, judge_scoring_gate, model_backtesting_gate, prompt_tuning_gate,
    Eligibility,
};
use crate::jobs::{create_job, JobRequest};
use crate::workers::backtest::{default_backtest_models, MAX_SPANS_FOR_BACKTESTING};

/// Counters every sweep reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: u64,
    pub jobs_created: u64,
    /// Refused because a same-scope job is already in flight.
    pub deduped: u64,
    /// Refused for lack of data (below thresholds, no criteria, …).
    pub skipped: u64,
}

impl SweepStats {
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "checked": self.checked,
            "jobs_created": self.jobs_created,
            "deduped": self.deduped,
            "skipped": self.skipped,
        })
    }

    fn record(&mut self, verdict: &Eligibility) {
        if verdict.is_deduped() {
            self.deduped += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// agent_discovery sweep: one candidate scope per active project.
pub async fn discover_agents_sweep(
    store: &dyn Store,
    broker: &dyn TaskBroker,
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();

    for project_id in store.active_project_ids().await? {
        stats.checked += 1;
        let verdict = agent_discovery_gate(store, project_id).await?;
        if !verdict.eligible {
            debug!(project_id = %project_id, reason = ?verdict.reason, "discovery skipped");
            stats.record(&verdict);
            continue;
        }

        let request = JobRequest::system(JobType::AgentDiscovery, project_id, None)
            .param("project_id", project_id.to_string())
            .stats(verdict.stats);
        match create_job(store, broker, request).await {
            Ok(_) => stats.jobs_created += 1,
            Err(err) if err.is_duplicate() => stats.deduped += 1,
            Err(err) => return Err(err),
        }
    }

    info!(created = stats.jobs_created, checked = stats.checked, "discovery sweep finished");
    Ok(stats)
}

/// auto_evaluation sweep: judge-scoring candidates are the latest
/// version of every prompt.
pub async fn auto_evaluation_sweep(
    store: &dyn Store,
    broker: &dyn TaskBroker,
) -> Result<SweepStats> {
    sweep_latest_prompts(store, broker, JobType::JudgeScoring, |stats| {
        info!(created = stats.jobs_created, checked = stats.checked, "auto-evaluation sweep finished");
    })
    .await
}

/// prompt_improvement sweep.
pub async fn prompt_improvement_sweep(
    store: &dyn Store,
    broker: &dyn TaskBroker,
) -> Result<SweepStats> {
    sweep_latest_prompts(store, broker, JobType::PromptTuning, |stats| {
        info!(created = stats.jobs_created, checked = stats.checked, "improvement sweep finished");
    })
    .await
}

/// model_backtesting sweep.
pub async fn backtest_candidates_sweep(
    store: &dyn Store,
    broker: &dyn TaskBroker,
) -> Result<SweepStats> {
    sweep_latest_prompts(store, broker, JobType::ModelBacktesting, |stats| {
        info!(created = stats.jobs_created, checked = stats.checked, "backtest sweep finished");
    })
    .await
}

async fn sweep_latest_prompts(
    store: &dyn Store,
    broker: &dyn TaskBroker,
    job_type: JobType,
    log: impl Fn(&SweepStats),
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();

    for project_id in store.active_project_ids().await? {
        for prompt in store.list_latest_prompts(project_id).await? {
            stats.checked += 1;

            let verdict = match job_type {
                JobType::JudgeScoring => judge_scoring_gate(store, &prompt).await?,
                JobType::PromptTuning => prompt_tuning_gate(store, &prompt).await?,
                JobType::ModelBacktesting => model_backtesting_gate(store, &prompt).await?,
                JobType::AgentDiscovery => continue,
            };
            if !verdict.eligible {
                debug!(
                    prompt = %prompt.prompt_id(),
                    job_type = %job_type,
                    reason = ?verdict.reason,
                    "sweep skipped prompt"
                );
                stats.record(&verdict);
                continue;
            }

            let mut request =
                JobRequest::system(job_type, project_id, Some(prompt.slug.clone()))
                    .param("prompt_id", prompt.prompt_id().to_string())
                    .param("project_id", project_id.to_string())
                    .param("prompt_slug", prompt.slug.clone());
            if job_type == JobType::ModelBacktesting {
                let scored = verdict
                    .stats
                    .get("scored_spans")
                    .cloned()
                    .unwrap_or(Value::from(0));
                request = request
                    .param("models", json!(default_backtest_models()))
                    .param("span_count", MAX_SPANS_FOR_BACKTESTING)
                    .param("scored_count_at_creation", scored);
            }
            request = request.stats(verdict.stats);

            match create_job(store, broker, request).await {
                Ok(_) => stats.jobs_created += 1,
                Err(err) if err.is_duplicate() => stats.deduped += 1,
                Err(err) => return Err(err),
            }
        }
    }

    log(&stats);
    Ok(stats)
}
