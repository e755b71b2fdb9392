//! Eligibility gates - one pure async predicate per job type.
//!
//! Gates never mutate state. They are called by the periodic sweeps
//! before inserting PENDING jobs and by user-facing endpoints before
//! accepting a user-triggered job; a refusal whose reason says
//! "already in progress" is surfaced distinctly so schedulers count it
//! as deduped rather than skipped for lack of data.

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use tracetune::model::{JobStatus, JobType, Prompt};
use tracetune::thresholds::next_improvement_threshold;
use tracetune::{Result, Store};

use crate::workers::discovery::extract_prompt_text;

/// Projects below this span count are not worth template extraction.
pub const MIN_SPANS_FOR_AGENT_DISCOVERY: i64 = 10;

/// Minimum unscored spans before a judge-scoring batch is worthwhile.
pub const MIN_UNSCORED_SPANS_FOR_SCORING: i64 = 10;

/// Minimum scored spans before backtesting produces a meaningful sample.
pub const MIN_SPANS_FOR_BACKTESTING: i64 = 10;

/// Cap on {pending, running} jobs per (project, slug, type).
pub const MAX_PENDING_JOBS_PER_PROMPT_AND_TYPE: usize = 2;

/// Latest-version adoption required before tuning (share of all scored
/// spans for the slug).
pub const ADOPTION_THRESHOLD: f64 = 0.25;

/// Activity window for tuning and backtesting.
pub const ACTIVITY_WINDOW_DAYS: i64 = 7;

const IN_PROGRESS: &str = "already in progress";

/// A gate's verdict: go / no-go, the reason, and observability stats.
#[derive(Debug, Clone, PartialEq)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub stats: Map<String, Value>,
}

impl Eligibility {
    fn ok(stats: Map<String, Value>) -> Self {
        Self {
            eligible: true,
            reason: None,
            stats,
        }
    }

    fn refuse(reason: impl Into<String>, stats: Map<String, Value>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
            stats,
        }
    }

    /// A same-scope job is already in flight - the scheduler counts
    /// this as deduped, user endpoints report a conflict.
    #[must_use]
    pub fn is_deduped(&self) -> bool {
        self.reason
            .as_deref()
            .map_or(false, |r| r.contains(IN_PROGRESS))
    }
}

async fn has_active_job(
    store: &dyn Store,
    project_id: Uuid,
    job_type: JobType,
    prompt_slug: Option<&str>,
) -> Result<bool> {
    Ok(!store
        .list_active_jobs(project_id, job_type, prompt_slug)
        .await?
        .is_empty())
}

/// agent_discovery: enough spans, at least one unmapped with usable
/// input, and no discovery already in flight for the project.
pub async fn agent_discovery_gate(store: &dyn Store, project_id: Uuid) -> Result<Eligibility> {
    let mut stats = Map::new();

    let total = store.count_spans(project_id).await?;
    stats.insert("total_spans".into(), total.into());
    if total < MIN_SPANS_FOR_AGENT_DISCOVERY {
        return Ok(Eligibility::refuse(
            format!("project has {total} spans, needs {MIN_SPANS_FOR_AGENT_DISCOVERY}"),
            stats,
        ));
    }

    let unmapped = store.list_unmapped_spans(project_id).await?;
    stats.insert("unmapped_spans".into(), (unmapped.len() as i64).into());
    if unmapped.is_empty() {
        return Ok(Eligibility::refuse("no unmapped spans", stats));
    }

    let usable = unmapped
        .iter()
        .filter(|s| extract_prompt_text(&s.input).is_some())
        .count();
    stats.insert("unmapped_with_input".into(), (usable as i64).into());
    if usable == 0 {
        return Ok(Eligibility::refuse(
            "no unmapped spans with usable input text",
            stats,
        ));
    }

    if has_active_job(store, project_id, JobType::AgentDiscovery, None).await? {
        return Ok(Eligibility::refuse(
            format!("agent discovery {IN_PROGRESS} for this project"),
            stats,
        ));
    }

    Ok(Eligibility::ok(stats))
}

/// judge_scoring: criteria present, enough unscored spans, no batch in
/// flight for the (project, slug).
pub async fn judge_scoring_gate(store: &dyn Store, prompt: &Prompt) -> Result<Eligibility> {
    let mut stats = Map::new();
    let prompt_id = prompt.prompt_id().to_string();

    if !prompt.evaluation_criteria.has_correctness() {
        return Ok(Eligibility::refuse(
            "prompt has no correctness criteria",
            stats,
        ));
    }

    let unscored = store.count_unscored_spans(&prompt_id).await?;
    stats.insert("unscored_spans".into(), unscored.into());
    if unscored < MIN_UNSCORED_SPANS_FOR_SCORING {
        return Ok(Eligibility::refuse(
            format!("{unscored} unscored spans, needs {MIN_UNSCORED_SPANS_FOR_SCORING}"),
            stats,
        ));
    }

    if has_active_job(
        store,
        prompt.project_id,
        JobType::JudgeScoring,
        Some(&prompt.slug),
    )
    .await?
    {
        return Ok(Eligibility::refuse(
            format!("judge scoring {IN_PROGRESS} for this prompt"),
            stats,
        ));
    }

    Ok(Eligibility::ok(stats))
}

/// prompt_tuning: recent traffic, threshold crossed, latest version
/// adopted, comparison material available, criteria present, nothing
/// in flight.
pub async fn prompt_tuning_gate(store: &dyn Store, prompt: &Prompt) -> Result<Eligibility> {
    let mut stats = Map::new();
    let prompt_id = prompt.prompt_id().to_string();

    let since = Utc::now() - Duration::days(ACTIVITY_WINDOW_DAYS);
    let recent = store.count_spans_for_prompt_since(&prompt_id, since).await?;
    stats.insert("spans_last_7_days".into(), recent.into());
    if recent < 1 {
        return Ok(Eligibility::refuse(
            format!("no spans in the last {ACTIVITY_WINDOW_DAYS} days"),
            stats,
        ));
    }

    let scored = store.count_scored_spans(&prompt_id).await?;
    let last = prompt.improvement_metadata.last_improvement_span_count;
    let threshold = next_improvement_threshold(last);
    stats.insert("scored_spans".into(), scored.into());
    stats.insert("next_threshold".into(), threshold.into());
    if scored < threshold {
        return Ok(Eligibility::refuse(
            format!("{scored} scored spans below next threshold {threshold}"),
            stats,
        ));
    }

    // Adoption is measured against all-time scored spans for the slug.
    let slug_scored = store
        .count_scored_spans_for_slug(prompt.project_id, &prompt.slug)
        .await?;
    let adoption = if slug_scored > 0 {
        scored as f64 / slug_scored as f64
    } else {
        0.0
    };
    stats.insert("adoption".into(), adoption.into());
    if adoption < ADOPTION_THRESHOLD {
        return Ok(Eligibility::refuse(
            format!(
                "latest version adoption {:.0}% below {:.0}%",
                adoption * 100.0,
                ADOPTION_THRESHOLD * 100.0
            ),
            stats,
        ));
    }

    if has_active_job(
        store,
        prompt.project_id,
        JobType::PromptTuning,
        Some(&prompt.slug),
    )
    .await?
    {
        return Ok(Eligibility::refuse(
            format!("prompt tuning {IN_PROGRESS} for this prompt"),
            stats,
        ));
    }

    if scored < 1 {
        return Ok(Eligibility::refuse("no spans for comparison analysis", stats));
    }

    if !prompt.evaluation_criteria.has_correctness() {
        return Ok(Eligibility::refuse(
            "prompt has no correctness criteria",
            stats,
        ));
    }

    Ok(Eligibility::ok(stats))
}

/// model_backtesting: recent traffic, enough scored spans, the
/// backtest ladder crossed since the last run, criteria present,
/// nothing in flight.
pub async fn model_backtesting_gate(store: &dyn Store, prompt: &Prompt) -> Result<Eligibility> {
    let mut stats = Map::new();
    let prompt_id = prompt.prompt_id().to_string();

    let since = Utc::now() - Duration::days(ACTIVITY_WINDOW_DAYS);
    let recent = store.count_spans_for_prompt_since(&prompt_id, since).await?;
    stats.insert("spans_last_7_days".into(), recent.into());
    if recent < 1 {
        return Ok(Eligibility::refuse(
            format!("no spans in the last {ACTIVITY_WINDOW_DAYS} days"),
            stats,
        ));
    }

    let scored = store.count_scored_spans(&prompt_id).await?;
    stats.insert("scored_spans".into(), scored.into());
    if scored < MIN_SPANS_FOR_BACKTESTING {
        return Ok(Eligibility::refuse(
            format!("{scored} scored spans, needs {MIN_SPANS_FOR_BACKTESTING}"),
            stats,
        ));
    }

    let last_count = last_backtest_scored_count(store, prompt).await?;
    let threshold = next_improvement_threshold(last_count);
    stats.insert("last_backtest_scored_count".into(), last_count.into());
    stats.insert("next_threshold".into(), threshold.into());
    if scored < threshold {
        return Ok(Eligibility::refuse(
            format!("{scored} scored spans below next backtest threshold {threshold}"),
            stats,
        ));
    }

    if has_active_job(
        store,
        prompt.project_id,
        JobType::ModelBacktesting,
        Some(&prompt.slug),
    )
    .await?
    {
        return Ok(Eligibility::refuse(
            format!("model backtesting {IN_PROGRESS} for this prompt"),
            stats,
        ));
    }

    if !prompt.evaluation_criteria.has_correctness() {
        return Ok(Eligibility::refuse(
            "prompt has no correctness criteria",
            stats,
        ));
    }

    Ok(Eligibility::ok(stats))
}

/// The scored-span count recorded by the most recent finished backtest
/// for this prompt's scope, 0 when none ran yet. This is what makes the
/// backtest ladder advance tick over tick.
async fn last_backtest_scored_count(store: &dyn Store, prompt: &Prompt) -> Result<i64> {
    let recent = store
        .list_recent_jobs(
            prompt.project_id,
            JobType::ModelBacktesting,
            Some(&prompt.slug),
            10,
        )
        .await?;
    Ok(recent
        .iter()
        .find(|j| {
            matches!(
                j.status,
                JobStatus::Completed | JobStatus::PartiallyCompleted
            )
        })
        .and_then(|j| j.result.get("scored_count_at_creation"))
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scored_span, seeded_prompt, unscored_span};
    use tracetune::model::Job;
    use tracetune::testing::MemoryStore;

    #[tokio::test]
    async fn judge_gate_boundary_at_ten_unscored_spans() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;

        for i in 0..9 {
            store.add_span(unscored_span(&prompt, i)).await;
        }
        let verdict = judge_scoring_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible, "9 spans must refuse: {:?}", verdict.reason);

        store.add_span(unscored_span(&prompt, 9)).await;
        let verdict = judge_scoring_gate(&store, &prompt).await.unwrap();
        assert!(verdict.eligible, "10 spans must pass: {:?}", verdict.reason);
        assert_eq!(verdict.stats["unscored_spans"], 10);
    }

    #[tokio::test]
    async fn judge_gate_requires_criteria() {
        let store = MemoryStore::new();
        let mut prompt = seeded_prompt(&store, "checkout").await;
        prompt.evaluation_criteria.correctness.clear();
        for i in 0..12 {
            store.add_span(unscored_span(&prompt, i)).await;
        }
        let verdict = judge_scoring_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.reason.unwrap().contains("criteria"));
    }

    #[tokio::test]
    async fn in_flight_job_reads_as_deduped() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..12 {
            store.add_span(unscored_span(&prompt, i)).await;
        }
        let running = Job::new(
            JobType::JudgeScoring,
            prompt.project_id,
            Some(prompt.slug.clone()),
        );
        store.insert_job(&running).await.unwrap();

        let verdict = judge_scoring_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.is_deduped());
    }

    #[tokio::test]
    async fn tuning_gate_checks_threshold_and_adoption() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        // 50 scored spans on the latest version, recent traffic.
        for i in 0..50 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }
        let verdict = prompt_tuning_gate(&store, &prompt).await.unwrap();
        assert!(verdict.eligible, "reason: {:?}", verdict.reason);

        // 49 scored: below the first rung.
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..49 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }
        let verdict = prompt_tuning_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.reason.unwrap().contains("threshold"));
    }

    #[tokio::test]
    async fn tuning_gate_rejects_low_adoption() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let v2 = prompt.next_version("new text {var_0}", 2);
        store.add_prompt(v2.clone()).await;

        // 200 scored on v1, only 50 on latest v2: 20% adoption.
        for i in 0..200 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }
        for i in 200..250 {
            store.add_span(scored_span(&v2, i, 0.8)).await;
        }
        let verdict = prompt_tuning_gate(&store, &v2).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.reason.unwrap().contains("adoption"));
    }

    #[tokio::test]
    async fn tuning_gate_requires_recent_traffic() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..60 {
            let mut span = scored_span(&prompt, i, 0.8);
            // Push all traffic outside the 7-day window.
            span.start_time_unix_nano = 1_000_000_000_000_000_000;
            span.end_time_unix_nano = 1_000_000_000_100_000_000;
            store.add_span(span).await;
        }
        let verdict = prompt_tuning_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.reason.unwrap().contains("last 7 days"));
    }

    #[tokio::test]
    async fn backtest_gate_ladder_advances_with_last_run() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..60 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }

        // No previous run: threshold 50, 60 scored -> eligible.
        let verdict = model_backtesting_gate(&store, &prompt).await.unwrap();
        assert!(verdict.eligible, "reason: {:?}", verdict.reason);

        // A completed run at 60 scored spans pushes the threshold to 100.
        let mut done = Job::new(
            JobType::ModelBacktesting,
            prompt.project_id,
            Some(prompt.slug.clone()),
        );
        done.status = JobStatus::Completed;
        done.result.set("scored_count_at_creation", 60);
        store.insert_job(&done).await.unwrap();

        let verdict = model_backtesting_gate(&store, &prompt).await.unwrap();
        assert!(!verdict.eligible);
        assert!(verdict.reason.unwrap().contains("threshold 100"));
    }

    #[tokio::test]
    async fn discovery_gate_needs_unmapped_spans_with_text() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        store.add_project(project).await;

        let verdict = agent_discovery_gate(&store, project).await.unwrap();
        assert!(!verdict.eligible);

        // 12 unmapped spans with proper message-list inputs.
        let donor = seeded_prompt(&store, "donor").await;
        for i in 0..12 {
            let mut span = unscored_span(&donor, 100 + i);
            span.project_id = project;
            span.prompt_id = None;
            span.input = serde_json::json!([
                {"role": "user", "content": format!("Hello user{i}, welcome!")}
            ]);
            store.add_span(span).await;
        }
        let verdict = agent_discovery_gate(&store, project).await.unwrap();
        assert!(verdict.eligible, "reason: {:?}", verdict.reason);
        assert_eq!(verdict.stats["total_spans"], 12);
        assert_eq!(verdict.stats["unmapped_with_input"], 12);
    }
}
