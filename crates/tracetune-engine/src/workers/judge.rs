//! judge_scoring worker: scores spans against per-prompt criteria.
//!
//! Two modes share one body: batch (sample the prompt's unscored
//! spans) and explicit (a user-picked span list, possibly spanning
//! prompts). Item failures never abort siblings; the job classifies
//! under the partial-completion rule.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{debug, warn};

use tracetune::llm::{call_with_retry, LlmGateway, LlmRequest, RetryPolicy};
use tracetune::model::{EvaluationCriteria, Job, PromptId, Span};
use tracetune::{Error, Result, Store};

use super::{classify_partial, WorkerOutcome};
use crate::prompts::{default_criteria, judge_kind_for, judge_prompt};

/// Bounded fanout for judge calls.
pub const MAX_CONCURRENT_EVALUATIONS: usize = 10;

/// Batch mode samples at most this many unscored spans per job.
pub const MAX_SPANS_PER_BATCH: usize = 50;

/// Parse the judge's structured response, tolerating fenced or prefixed
/// output around the JSON object.
pub fn parse_correctness(content: &str) -> Result<f64> {
    let object: Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(_) => {
            let start = content.find('{');
            let end = content.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str(&content[start..=end])
                        .map_err(|e| Error::Llm(format!("judge returned malformed JSON: {e}")))?
                }
                _ => {
                    return Err(Error::Llm(format!(
                        "judge returned no JSON object: {content}"
                    )))
                }
            }
        }
    };
    let correctness = object
        .get("correctness")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Llm("judge response missing correctness".to_string()))?;
    Ok(correctness.clamp(0.0, 1.0))
}

/// Score one span and return its id alongside the outcome.
async fn evaluate_span_with_id(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    pair: (&Span, EvaluationCriteria),
) -> (String, Result<f64>) {
    let (span, criteria) = pair;
    let outcome = evaluate_span(store, gateway, &criteria, span).await;
    (span.span_id.clone(), outcome)
}

/// Score one span and persist the result.
async fn evaluate_span(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    criteria: &EvaluationCriteria,
    span: &Span,
) -> Result<f64> {
    let kind = judge_kind_for(span);
    let effective = if criteria.has_correctness() {
        criteria.clone()
    } else {
        default_criteria(kind)
    };

    let prompt = judge_prompt(kind, &effective, &span.input, &span.output);
    let response = call_with_retry(
        gateway,
        LlmRequest::text(prompt).with_json_response(),
        RetryPolicy::default(),
    )
    .await?;

    let correctness = parse_correctness(&response.content)?;
    store
        .set_span_correctness(&span.span_id, correctness)
        .await?;
    Ok(correctness)
}

/// Criteria come from each span's own prompt (explicit lists may span
/// several prompts); unresolvable prompts fall back to defaults.
async fn criteria_for_span(
    store: &dyn Store,
    cache: &mut HashMap<String, EvaluationCriteria>,
    span: &Span,
) -> EvaluationCriteria {
    let Some(prompt_id) = span.prompt_id.as_deref() else {
        return EvaluationCriteria::default();
    };
    if let Some(found) = cache.get(prompt_id) {
        return found.clone();
    }
    let criteria = match PromptId::parse(prompt_id) {
        Ok(id) => store
            .get_prompt(id.project_id, &id.slug, id.version)
            .await
            .ok()
            .flatten()
            .map(|p| p.evaluation_criteria)
            .unwrap_or_default(),
        Err(_) => EvaluationCriteria::default(),
    };
    cache.insert(prompt_id.to_string(), criteria.clone());
    criteria
}

/// The judge-scoring body.
pub async fn run(store: &dyn Store, gateway: &dyn LlmGateway, job: Job) -> Result<WorkerOutcome> {
    let explicit_ids: Option<Vec<String>> = job
        .result
        .parameters
        .get("span_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });

    let (spans_found, selected) = match explicit_ids {
        Some(ids) => {
            let spans = store.get_spans(&ids).await?;
            let selected: Vec<Span> = spans
                .into_iter()
                .filter(|s| !s.is_system_generated())
                .collect();
            (ids.len() as i64, selected)
        }
        None => {
            let prompt_id = job
                .result
                .param_str("prompt_id")
                .ok_or_else(|| Error::InvalidData("judge job missing prompt_id".into()))?
                .to_string();
            let found = store.count_unscored_spans(&prompt_id).await?;
            let candidates = store.list_unscored_spans(&prompt_id, 1000).await?;
            let selected: Vec<Span> = {
                let mut rng = rand::thread_rng();
                candidates
                    .choose_multiple(&mut rng, MAX_SPANS_PER_BATCH)
                    .cloned()
                    .collect()
            };
            (found, selected)
        }
    };

    if selected.is_empty() {
        return Ok(WorkerOutcome::completed()
            .field("spans_found", spans_found)
            .field("spans_selected", 0)
            .field("spans_evaluated", 0)
            .field("reason", "no spans to evaluate"));
    }

    let mut criteria_cache = HashMap::new();
    let mut jobs = Vec::with_capacity(selected.len());
    for span in &selected {
        let criteria = criteria_for_span(store, &mut criteria_cache, span).await;
        jobs.push((span, criteria));
    }

    let pending: Vec<_> = jobs
        .into_iter()
        .map(|pair| evaluate_span_with_id(store, gateway, pair))
        .collect();
    let results: Vec<(String, Result<f64>)> = stream::iter(pending)
        .buffer_unordered(MAX_CONCURRENT_EVALUATIONS)
        .collect()
        .await;

    let mut evaluated = 0usize;
    let mut errors = Vec::new();
    for (span_id, outcome) in &results {
        match outcome {
            Ok(score) => {
                debug!(span_id = %span_id, score, "span scored");
                evaluated += 1;
            }
            Err(err) => {
                warn!(span_id = %span_id, error = %err, "span evaluation failed");
                errors.push(json!({"span_id": span_id, "error": err.to_string()}));
            }
        }
    }

    let status = classify_partial(evaluated, selected.len());
    let mut outcome = WorkerOutcome::with_status(status)
        .field("spans_found", spans_found)
        .field("spans_selected", selected.len())
        .field("spans_evaluated", evaluated)
        .field("spans_failed", errors.len());
    if !errors.is_empty() {
        outcome = outcome.field("errors", Value::Array(errors));
    }
    Ok(outcome)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_prompt, unscored_span};
    use tracetune::model::{JobStatus, JobType};
    use tracetune::testing::{MemoryStore, MockGateway};

    fn judge_job(prompt: &tracetune::model::Prompt) -> Job {
        let mut job = Job::new(
            JobType::JudgeScoring,
            prompt.project_id,
            Some(prompt.slug.clone()),
        );
        job.result.parameters.insert(
            "prompt_id".into(),
            Value::String(prompt.prompt_id().to_string()),
        );
        job
    }

    #[test]
    fn correctness_parsing_is_tolerant_and_clamped() {
        assert_eq!(parse_correctness(r#"{"correctness": 0.8}"#).unwrap(), 0.8);
        assert_eq!(parse_correctness(r#"{"correctness": 1.7}"#).unwrap(), 1.0);
        assert_eq!(parse_correctness(r#"{"correctness": -0.2}"#).unwrap(), 0.0);
        assert_eq!(
            parse_correctness("Here you go:\n```json\n{\"correctness\": 0.5}\n```").unwrap(),
            0.5
        );
        assert!(parse_correctness("no json here").is_err());
        assert!(parse_correctness(r#"{"score": 0.5}"#).is_err());
    }

    #[tokio::test]
    async fn batch_mode_scores_all_selected_spans() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..12 {
            store.add_span(unscored_span(&prompt, i)).await;
        }

        let gateway = MockGateway::new().with_default_text(r#"{"correctness": 0.9}"#);
        let outcome = run(&store, &gateway, judge_job(&prompt)).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.output["spans_found"], 12);
        assert_eq!(outcome.output["spans_selected"], 12);
        assert_eq!(outcome.output["spans_evaluated"], 12);

        let scored = store
            .count_scored_spans(&prompt.prompt_id().to_string())
            .await
            .unwrap();
        assert_eq!(scored, 12);
    }

    #[tokio::test]
    async fn partial_failures_classify_partially_completed() {
        // 12 spans, two judge calls fail with a non-rate-limit
        // error (one retry each), ten succeed.
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..12 {
            store.add_span(unscored_span(&prompt, i)).await;
        }

        let gateway = MockGateway::new().with_default_text(r#"{"correctness": 0.7}"#);
        // Two spans always fail (original call plus the one retry).
        gateway.fail_when_contains("Question number 3?");
        gateway.fail_when_contains("Question number 7?");

        let outcome = run(&store, &gateway, judge_job(&prompt)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::PartiallyCompleted);
        assert_eq!(outcome.output["spans_evaluated"], 10);
        assert_eq!(outcome.output["spans_failed"], 2);

        let scored = store
            .count_scored_spans(&prompt.prompt_id().to_string())
            .await
            .unwrap();
        assert_eq!(scored, 10);
    }

    #[tokio::test]
    async fn all_failures_classify_failed() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        store.add_span(unscored_span(&prompt, 0)).await;

        let gateway = MockGateway::new();
        gateway.push_error("down");
        gateway.push_error("still down");

        let outcome = run(&store, &gateway, judge_job(&prompt)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn batch_mode_caps_selection_at_fifty() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..70 {
            store.add_span(unscored_span(&prompt, i)).await;
        }

        let gateway = MockGateway::new().with_default_text(r#"{"correctness": 0.6}"#);
        let outcome = run(&store, &gateway, judge_job(&prompt)).await.unwrap();
        assert_eq!(outcome.output["spans_found"], 70);
        assert_eq!(outcome.output["spans_selected"], 50);
        assert_eq!(gateway.call_count(), 50);
    }

    #[tokio::test]
    async fn explicit_span_list_skips_system_spans() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let real = unscored_span(&prompt, 0);
        let mut synthetic = unscored_span(&prompt, 1);
        synthetic.operation = "prompt_tuning".to_string();
        let ids = vec![real.span_id.clone(), synthetic.span_id.clone()];
        store.add_span(real).await;
        store.add_span(synthetic).await;

        let mut job = Job::new(
            JobType::JudgeScoring,
            prompt.project_id,
            Some(prompt.slug.clone()),
        );
        job.result
            .parameters
            .insert("span_ids".into(), json!(ids));

        let gateway = MockGateway::new().with_default_text(r#"{"correctness": 0.8}"#);
        let outcome = run(&store, &gateway, job).await.unwrap();
        assert_eq!(outcome.output["spans_selected"], 1);
        assert_eq!(outcome.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn empty_batch_completes_with_reason() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let gateway = MockGateway::new();

        let outcome = run(&store, &gateway, judge_job(&prompt)).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.output["reason"], "no spans to evaluate");
        assert_eq!(gateway.call_count(), 0);
    }
}
