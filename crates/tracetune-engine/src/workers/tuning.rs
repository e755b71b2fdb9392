//! prompt_tuning worker: generates an improved template candidate,
//! replays recent traffic against it, and ships a new version plus a
//! suggestion when the candidate actually scores better.
//!
//! The work is idempotent on the artifact: a repeat run may produce
//! another candidate version but never silently overwrites state, and
//! candidates whose content hash matches an existing version are
//! reused instead of duplicated.

use serde_json::{Map, Value};
use tracing::{info, warn};

use tracetune::llm::{call_with_retry, LlmGateway, LlmRequest, RetryPolicy};
use tracetune::model::{
    content_hash, history_entry, Job, PromptId, Span, SpanMetadata, Suggestion, OP_PROMPT_TUNING,
};
use tracetune::{Error, Result, Store};

use super::judge::parse_correctness;
use super::replay::replay_span;
use super::WorkerOutcome;
use crate::prompts::{
    format_span_examples, improvement_prompt, judge_kind_for, judge_prompt, suggestion_prompt,
};

/// Score bands used for bucketing: `[0,0.2) … [0.8,1.0]`, top closed.
pub const SCORE_BANDS: usize = 5;

/// Cap per band when collecting analysis material.
pub const MAX_SPANS_PER_BAND: usize = 15;

/// Cap on the replay comparison set.
pub const MAX_COMPARISON_SPANS: usize = 50;

/// Reason recorded when the candidate equals the current version.
pub const IDENTICAL_REASON: &str = "identical to existing version";

/// Bucket scored spans into the five bands.
#[must_use]
pub fn bucket_by_score(spans: Vec<Span>) -> [Vec<Span>; SCORE_BANDS] {
    let mut bands: [Vec<Span>; SCORE_BANDS] = Default::default();
    for span in spans {
        let Some(score) = span.feedback_score.correctness else {
            continue;
        };
        // The top band is closed so 1.0 lands in band 4.
        let band = ((score / 0.2) as usize).min(SCORE_BANDS - 1);
        bands[band].push(span);
    }
    bands
}

/// Comparison set: up to the cap, lower bands first so the replay
/// spends its budget where the current prompt does worst.
#[must_use]
pub fn select_comparison_spans(bands: &[Vec<Span>; SCORE_BANDS]) -> Vec<Span> {
    let mut selected = Vec::new();
    for band in bands {
        for span in band {
            if selected.len() >= MAX_COMPARISON_SPANS {
                return selected;
            }
            selected.push(span.clone());
        }
    }
    selected
}

struct ComparisonResult {
    old_score: f64,
    new_score: f64,
    old_latency_ms: f64,
    new_latency_ms: f64,
    old_cost: f64,
    new_cost: f64,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}

/// The prompt-tuning body.
pub async fn run(store: &dyn Store, gateway: &dyn LlmGateway, job: Job) -> Result<WorkerOutcome> {
    let prompt_id_str = job
        .result
        .param_str("prompt_id")
        .ok_or_else(|| Error::InvalidData("tuning job missing prompt_id".into()))?
        .to_string();
    let prompt_id = PromptId::parse(&prompt_id_str)?;
    let mut prompt = store
        .get_prompt(prompt_id.project_id, &prompt_id.slug, prompt_id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id_str}")))?;

    let scored = store.list_scored_spans(&prompt_id_str).await?;
    let scored_count = scored.len() as i64;
    let bands = bucket_by_score(scored);

    // Analysis material: capped per band; suggestions come from the two
    // lowest populated bands.
    let mut poor: Vec<Span> = Vec::new();
    for band in bands.iter().take(2) {
        poor.extend(band.iter().take(MAX_SPANS_PER_BAND).cloned());
    }
    if poor.is_empty() {
        // Nothing scored badly: learn from the weakest band there is.
        if let Some(band) = bands.iter().find(|b| !b.is_empty()) {
            poor.extend(band.iter().take(MAX_SPANS_PER_BAND).cloned());
        }
    }
    let good: Vec<Span> = bands[SCORE_BANDS - 1]
        .iter()
        .take(MAX_SPANS_PER_BAND)
        .cloned()
        .collect();

    if poor.is_empty() {
        return Err(Error::NotEligible("no scored spans to analyse".into()));
    }

    // Tool-calling prompts get the tool-aware suggestion variant, with
    // the definitions as read-only context.
    let tool_aware = poor.iter().any(|s| s.metadata.response_type().is_some());

    let suggestions = call_with_retry(
        gateway,
        LlmRequest::text(suggestion_prompt(
            &prompt.prompt,
            &format_span_examples(&poor, 10),
            tool_aware,
        )),
        RetryPolicy::default(),
    )
    .await?
    .content;

    let candidate_text = call_with_retry(
        gateway,
        LlmRequest::text(improvement_prompt(
            &prompt.prompt,
            &suggestions,
            &format_span_examples(&good, 5),
            &format_span_examples(&poor, 5),
        )),
        RetryPolicy::default(),
    )
    .await?
    .content
    .trim()
    .to_string();

    if content_hash(&candidate_text) == prompt.content_hash {
        prompt.improvement_metadata.record_attempt(scored_count);
        store.update_prompt(&prompt).await?;
        info!(prompt_id = %prompt_id_str, "candidate identical to current version");
        return Ok(WorkerOutcome::cancelled(IDENTICAL_REASON)
            .field("last_improvement_span_count", scored_count));
    }

    let comparison = select_comparison_spans(&bands);
    let mut results: Vec<ComparisonResult> = Vec::new();
    let mut replay_failures = 0usize;

    for span in &comparison {
        let replayed = match replay_span(gateway, &candidate_text, span, None).await {
            Ok(replay) => replay,
            Err(err) => {
                warn!(span_id = %span.span_id, error = %err, "replay failed");
                replay_failures += 1;
                continue;
            }
        };

        // Judge the replayed output with the prompt's own criteria.
        let judge_request = LlmRequest::text(judge_prompt(
            judge_kind_for(span),
            &prompt.evaluation_criteria,
            &span.input,
            &replayed.output,
        ))
        .with_json_response();
        let new_score = match call_with_retry(gateway, judge_request, RetryPolicy::default()).await
        {
            Ok(response) => match parse_correctness(&response.content) {
                Ok(score) => score,
                Err(err) => {
                    warn!(span_id = %span.span_id, error = %err, "replay scoring failed");
                    replay_failures += 1;
                    continue;
                }
            },
            Err(err) => {
                warn!(span_id = %span.span_id, error = %err, "replay scoring failed");
                replay_failures += 1;
                continue;
            }
        };

        // Replay spans are persisted whatever the verdict, flagged so
        // they never count as real traffic or get re-scored.
        persist_replay_span(store, &prompt_id_str, span, &replayed.output, new_score).await?;

        results.push(ComparisonResult {
            old_score: span.feedback_score.correctness.unwrap_or(0.0),
            new_score,
            old_latency_ms: span.latency_ms(),
            new_latency_ms: replayed.stats.response_ms,
            old_cost: span.metadata.cost().unwrap_or(0.0),
            new_cost: replayed.stats.response_cost,
        });
    }

    if results.is_empty() {
        return Err(Error::Llm(format!(
            "all {replay_failures} replay calls failed"
        )));
    }

    let avg_old = mean(results.iter().map(|r| r.old_score));
    let avg_new = mean(results.iter().map(|r| r.new_score));
    let latency_delta = mean(results.iter().map(|r| r.new_latency_ms - r.old_latency_ms));
    let cost_delta = mean(results.iter().map(|r| r.new_cost - r.old_cost));
    let score_delta = avg_new - avg_old;

    if score_delta <= 0.0 {
        prompt.improvement_metadata.record_attempt(scored_count);
        store.update_prompt(&prompt).await?;
        info!(
            prompt_id = %prompt_id_str,
            avg_old, avg_new, "candidate did not improve"
        );
        return Ok(WorkerOutcome::completed()
            .detail("no_improvement")
            .field("avg_correctness_old", avg_old)
            .field("avg_correctness_new", avg_new)
            .field("spans_compared", results.len())
            .field("last_improvement_span_count", scored_count));
    }

    // Candidate wins: mint the next version unless the same content
    // already exists somewhere in this project.
    if let Some(existing) = store
        .find_prompt_by_hash(prompt.project_id, &content_hash(&candidate_text))
        .await?
    {
        prompt.improvement_metadata.record_attempt(scored_count);
        store.update_prompt(&prompt).await?;
        info!(
            prompt_id = %prompt_id_str,
            existing_version = existing.version,
            "candidate matches an existing version"
        );
        return Ok(WorkerOutcome::completed()
            .detail("no_improvement")
            .field("reused_version", existing.version)
            .field("avg_correctness_old", avg_old)
            .field("avg_correctness_new", avg_new));
    }

    let next_version = store
        .max_prompt_version(prompt.project_id, &prompt.slug)
        .await?
        + 1;
    let mut new_prompt = prompt.next_version(candidate_text.clone(), next_version);
    new_prompt.improvement_metadata.record_attempt(scored_count);
    new_prompt
        .improvement_metadata
        .improvement_history
        .push(history_entry(&[
            ("from_version", prompt.version.into()),
            ("to_version", next_version.into()),
            ("avg_correctness_old", avg_old.into()),
            ("avg_correctness_new", avg_new.into()),
            ("spans_compared", results.len().into()),
        ]));
    store.insert_prompt(&new_prompt).await?;

    let mut scores = Map::new();
    scores.insert("avg_correctness_old".into(), avg_old.into());
    scores.insert("avg_correctness_new".into(), avg_new.into());
    scores.insert("latency_delta_ms".into(), latency_delta.into());
    scores.insert("cost_delta".into(), cost_delta.into());
    scores.insert("spans_compared".into(), results.len().into());

    let suggestion = Suggestion::prompt_swap(
        prompt.project_id,
        prompt.slug.clone(),
        candidate_text,
        next_version,
        scores,
    );
    store.insert_suggestion(&suggestion).await?;

    info!(
        prompt_id = %prompt_id_str,
        new_version = next_version,
        avg_old,
        avg_new,
        "created improved prompt version"
    );

    Ok(WorkerOutcome::completed()
        .field("new_version", next_version)
        .field("suggestion_id", suggestion.id.to_string())
        .field("avg_correctness_old", avg_old)
        .field("avg_correctness_new", avg_new)
        .field("spans_compared", results.len())
        .field("replay_failures", replay_failures))
}

/// Persist one replay span. The correctness verdict lives in the
/// metadata bag - `feedback_score.correctness` stays reserved for real
/// traffic so scored-span counts never see synthetic rows.
async fn persist_replay_span(
    store: &dyn Store,
    prompt_id: &str,
    original: &Span,
    output: &Value,
    score: f64,
) -> Result<()> {
    let mut metadata = SpanMetadata(original.metadata.0.clone());
    metadata.mark_tuning_replay();
    metadata.insert("replay_correctness", score);
    metadata.insert("replayed_span_id", original.span_id.clone());

    let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let replay = Span {
        span_id: uuid::Uuid::new_v4().to_string(),
        trace_id: original.trace_id,
        parent_span_id: None,
        prompt_id: Some(prompt_id.to_string()),
        project_id: original.project_id,
        start_time_unix_nano: now_nanos,
        end_time_unix_nano: now_nanos,
        input: original.input.clone(),
        output: output.clone(),
        input_params: original.input_params.clone(),
        output_params: Value::Null,
        operation: OP_PROMPT_TUNING.to_string(),
        metadata,
        feedback_score: Default::default(),
        created_at: chrono::Utc::now(),
    };
    store.insert_span(&replay).await
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scored_span, seeded_prompt};
    use tracetune::model::{JobStatus, JobType, Prompt};
    use tracetune::testing::{MemoryStore, MockGateway};

    fn tuning_job(prompt: &Prompt) -> Job {
        let mut job = Job::new(
            JobType::PromptTuning,
            prompt.project_id,
            Some(prompt.slug.clone()),
        );
        job.result.parameters.insert(
            "prompt_id".into(),
            Value::String(prompt.prompt_id().to_string()),
        );
        job
    }

    /// Gateway scripted for one tuning pass: suggestion text, candidate
    /// text, then alternating replay output + judge score.
    fn scripted_gateway(candidate: &str, replay_score: f64) -> MockGateway {
        let gateway = MockGateway::new()
            .with_default_text(format!(r#"{{"correctness": {replay_score}}}"#));
        gateway.push_text("Tighten the instructions.");
        gateway.push_text(candidate);
        gateway
    }

    async fn seed_sixty_scored(store: &MemoryStore, prompt: &Prompt, score: f64) {
        for i in 0..60 {
            store.add_span(scored_span(prompt, i, score)).await;
        }
    }

    #[test]
    fn bucketing_respects_band_edges() {
        let prompt = Prompt::new(uuid::Uuid::new_v4(), "s", "t {var_0}");
        let spans = vec![
            scored_span(&prompt, 0, 0.0),
            scored_span(&prompt, 1, 0.19),
            scored_span(&prompt, 2, 0.2),
            scored_span(&prompt, 3, 0.79),
            scored_span(&prompt, 4, 0.8),
            scored_span(&prompt, 5, 1.0),
        ];
        let bands = bucket_by_score(spans);
        assert_eq!(bands[0].len(), 2);
        assert_eq!(bands[1].len(), 1);
        assert_eq!(bands[3].len(), 1);
        // 1.0 lands in the closed top band.
        assert_eq!(bands[4].len(), 2);
    }

    #[test]
    fn comparison_selection_prefers_low_bands() {
        let prompt = Prompt::new(uuid::Uuid::new_v4(), "s", "t {var_0}");
        let mut spans = Vec::new();
        for i in 0..40 {
            spans.push(scored_span(&prompt, i, 0.1));
        }
        for i in 40..80 {
            spans.push(scored_span(&prompt, i, 0.9));
        }
        let bands = bucket_by_score(spans);
        let selected = select_comparison_spans(&bands);
        assert_eq!(selected.len(), MAX_COMPARISON_SPANS);
        let low = selected
            .iter()
            .filter(|s| s.feedback_score.correctness == Some(0.1))
            .count();
        assert_eq!(low, 40);
    }

    #[tokio::test]
    async fn no_improvement_advances_counter_without_new_version() {
        // 60 scored spans at 0.80; replays judge at 0.78.
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        seed_sixty_scored(&store, &prompt, 0.8).await;

        let gateway = scripted_gateway("A different candidate template {var_0}", 0.78);
        let outcome = run(&store, &gateway, tuning_job(&prompt)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.detail.as_deref(), Some("no_improvement"));
        assert_eq!(outcome.output["last_improvement_span_count"], 60);

        // No new version.
        assert_eq!(
            store
                .max_prompt_version(prompt.project_id, &prompt.slug)
                .await
                .unwrap(),
            1
        );

        // Counter advanced and invalidation cleared on the stored row.
        let stored = store
            .get_prompt(prompt.project_id, &prompt.slug, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.improvement_metadata.last_improvement_span_count, 60);
        assert_eq!(stored.improvement_metadata.criteria_invalidated, None);

        // Replay spans persisted as synthetic, capped at 50.
        let synthetic: Vec<_> = store
            .all_spans()
            .await
            .into_iter()
            .filter(|s| s.operation == OP_PROMPT_TUNING)
            .collect();
        assert!(!synthetic.is_empty());
        assert!(synthetic.len() <= MAX_COMPARISON_SPANS);
        assert!(synthetic.iter().all(|s| s.is_system_generated()));
        // Synthetic rows never carry a judge score.
        assert!(synthetic.iter().all(|s| !s.is_scored()));
    }

    #[tokio::test]
    async fn improvement_creates_version_and_suggestion() {
        // Replays judge at 0.92 against a 0.80 baseline.
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        seed_sixty_scored(&store, &prompt, 0.8).await;

        let gateway = scripted_gateway("Much better template: {var_0}", 0.92);
        let outcome = run(&store, &gateway, tuning_job(&prompt)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.output["new_version"], 2);

        let v2 = store
            .get_prompt(prompt.project_id, &prompt.slug, 2)
            .await
            .unwrap()
            .unwrap();
        assert!(!v2.is_active);
        assert_ne!(v2.content_hash, prompt.content_hash);
        assert_eq!(v2.improvement_metadata.last_improvement_span_count, 60);
        assert_eq!(v2.improvement_metadata.improvement_history.len(), 1);

        let suggestions = store.all_suggestions().await;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].new_prompt_version, Some(2));
        let old = suggestions[0].scores["avg_correctness_old"].as_f64().unwrap();
        let new = suggestions[0].scores["avg_correctness_new"].as_f64().unwrap();
        assert!((old - 0.8).abs() < 1e-9);
        assert!((new - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn identical_candidate_cancels_and_advances_counter() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        seed_sixty_scored(&store, &prompt, 0.5).await;

        // Candidate equal to the current template text.
        let gateway = scripted_gateway(&prompt.prompt.clone(), 0.9);
        let outcome = run(&store, &gateway, tuning_job(&prompt)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.output["reason"], IDENTICAL_REASON);
        // Only the two generation calls happened - no replays.
        assert_eq!(gateway.call_count(), 2);

        let stored = store
            .get_prompt(prompt.project_id, &prompt.slug, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.improvement_metadata.last_improvement_span_count, 60);
    }

    #[tokio::test]
    async fn candidate_matching_existing_version_is_reused() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let v2 = prompt.next_version("Existing v2 template {var_0}", 2);
        store.add_prompt(v2.clone()).await;
        // Traffic still on v1 for this test.
        seed_sixty_scored(&store, &prompt, 0.5).await;

        let gateway = scripted_gateway("Existing v2 template {var_0}", 0.95);
        let outcome = run(&store, &gateway, tuning_job(&prompt)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.detail.as_deref(), Some("no_improvement"));
        assert_eq!(outcome.output["reused_version"], 2);
        // Still only two versions, no suggestion.
        assert_eq!(
            store
                .max_prompt_version(prompt.project_id, &prompt.slug)
                .await
                .unwrap(),
            2
        );
        assert!(store.all_suggestions().await.is_empty());
    }
}
