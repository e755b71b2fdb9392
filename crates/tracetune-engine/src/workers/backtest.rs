//! model_backtesting worker: replays a prompt's recent traffic against
//! candidate models and recommends a swap when one clearly wins.
//!
//! Work items fan out as (span x model) pairs interleaved by provider
//! so concurrent calls spread across providers instead of hammering
//! one, bounded by a five-permit semaphore.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tracing::{info, warn};

use tracetune::llm::{
    call_with_retry, normalize_model_name, provider_for_model, LlmGateway, LlmRequest, RetryPolicy,
};
use tracetune::model::{
    meta_keys, BacktestRun, BacktestStatus, Job, PromptId, ResponseType, Span, SpanMetadata,
    Suggestion, OP_BACKTEST_PREFIX,
};
use tracetune::{Error, Result, Store};

use super::judge::parse_correctness;
use super::replay::replay_span;
use super::{classify_partial, WorkerOutcome};
use crate::prompts::{judge_kind_for, judge_prompt};
use crate::recommend::{
    generate_recommendations, BaselineMetrics, ModelMetrics, Verdict,
};

/// Hard cap on the replay sample per run.
pub const MAX_SPANS_FOR_BACKTESTING: usize = 50;

/// Bounded fanout over (span x model) items.
pub const MAX_CONCURRENT_BACKTESTS: usize = 5;

/// Candidate models tried when a job does not pin its own list.
#[must_use]
pub fn default_backtest_models() -> Vec<String> {
    vec![
        "gpt-5-mini".to_string(),
        "gpt-5-nano".to_string(),
        "claude-haiku-4-5".to_string(),
        "claude-sonnet-4-6".to_string(),
        "gemini-2.5-flash".to_string(),
    ]
}

/// Round-robin models across providers so adjacent work items hit
/// different providers.
#[must_use]
pub fn interleave_by_provider(models: &[String]) -> Vec<String> {
    let mut by_provider: Vec<(&str, Vec<&String>)> = Vec::new();
    for model in models {
        let provider = provider_for_model(model).unwrap_or("unknown");
        match by_provider.iter_mut().find(|(p, _)| *p == provider) {
            Some((_, bucket)) => bucket.push(model),
            None => by_provider.push((provider, vec![model])),
        }
    }

    let mut interleaved = Vec::with_capacity(models.len());
    let mut index = 0;
    loop {
        let mut pushed = false;
        for (_, bucket) in &by_provider {
            if let Some(model) = bucket.get(index) {
                interleaved.push((*model).clone());
                pushed = true;
            }
        }
        if !pushed {
            break;
        }
        index += 1;
    }
    interleaved
}

/// The most frequent (normalised) request model across the sample.
#[must_use]
pub fn detect_current_model(spans: &[Span]) -> Option<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for span in spans {
        if let Some(model) = span.metadata.request_model() {
            *counts.entry(normalize_model_name(model)).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(model, _)| model)
}

/// Baseline score/latency/cost measured on the sampled real traffic.
#[must_use]
pub fn compute_baseline(spans: &[Span], current_model: Option<String>) -> BaselineMetrics {
    let n = spans.len().max(1) as f64;
    BaselineMetrics {
        model: current_model,
        avg_score: spans
            .iter()
            .filter_map(|s| s.feedback_score.correctness)
            .sum::<f64>()
            / n,
        avg_latency_ms: spans.iter().map(Span::latency_ms).sum::<f64>() / n,
        avg_cost: spans
            .iter()
            .filter_map(|s| s.metadata.cost())
            .sum::<f64>()
            / n,
    }
}

struct ItemResult {
    score: f64,
    latency_ms: f64,
    cost: f64,
    tokens: i64,
}

/// The model-backtesting body.
pub async fn run(store: &dyn Store, gateway: &dyn LlmGateway, job: Job) -> Result<WorkerOutcome> {
    let prompt_id_str = job
        .result
        .param_str("prompt_id")
        .ok_or_else(|| Error::InvalidData("backtest job missing prompt_id".into()))?
        .to_string();
    let prompt_id = PromptId::parse(&prompt_id_str)?;
    let prompt = store
        .get_prompt(prompt_id.project_id, &prompt_id.slug, prompt_id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id_str}")))?;

    let models: Vec<String> = job
        .result
        .parameters
        .get("models")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(default_backtest_models);
    let span_count = job
        .result
        .parameters
        .get("span_count")
        .and_then(Value::as_u64)
        .map(|n| (n as usize).min(MAX_SPANS_FOR_BACKTESTING))
        .unwrap_or(MAX_SPANS_FOR_BACKTESTING);

    let run_record = BacktestRun::new(prompt_id_str.clone(), models.clone());
    store.insert_backtest_run(&run_record).await?;

    let body = execute(
        store,
        gateway,
        &prompt,
        &prompt_id_str,
        &run_record,
        &models,
        span_count,
        &job,
    )
    .await;

    match body {
        Ok(outcome) => {
            let mut finished = run_record;
            finished.status = BacktestStatus::Completed;
            finished.completed_at = Some(chrono::Utc::now());
            store.update_backtest_run(&finished).await?;
            Ok(outcome)
        }
        Err(err) => {
            let mut failed = run_record;
            failed.status = BacktestStatus::Failed;
            failed.completed_at = Some(chrono::Utc::now());
            store.update_backtest_run(&failed).await?;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    prompt: &tracetune::model::Prompt,
    prompt_id_str: &str,
    run_record: &BacktestRun,
    models: &[String],
    span_count: usize,
    job: &Job,
) -> Result<WorkerOutcome> {
    let sample: Vec<Span> = store
        .list_scored_spans(prompt_id_str)
        .await?
        .into_iter()
        .filter(|s| !s.input.is_null())
        .take(span_count)
        .collect();
    if sample.is_empty() {
        return Err(Error::NotEligible("no scored spans to replay".into()));
    }

    let current_model = detect_current_model(&sample);
    let baseline = compute_baseline(&sample, current_model.clone());

    let interleaved = interleave_by_provider(models);
    let items: Vec<(&Span, &String)> = sample
        .iter()
        .flat_map(|span| interleaved.iter().map(move |model| (span, model)))
        .collect();
    let total_items = items.len();

    let pending: Vec<_> = items
        .into_iter()
        .map(|pair| run_item_with_model(store, gateway, prompt, prompt_id_str, run_record, pair))
        .collect();
    let results: Vec<(String, Result<ItemResult>)> = stream::iter(pending)
        .buffer_unordered(MAX_CONCURRENT_BACKTESTS)
        .collect()
        .await;

    let mut success_count = 0usize;
    let mut per_model: HashMap<String, Vec<ItemResult>> = HashMap::new();
    for (model, outcome) in results {
        match outcome {
            Ok(item) => {
                success_count += 1;
                per_model.entry(model).or_default().push(item);
            }
            Err(err) => {
                warn!(model = %model, error = %err, "backtest item failed");
            }
        }
    }

    let samples_per_model = sample.len();
    let mut metrics: Vec<ModelMetrics> = models
        .iter()
        .filter_map(|model| {
            let items = per_model.get(model)?;
            let n = items.len() as f64;
            Some(ModelMetrics {
                model: model.clone(),
                avg_score: items.iter().map(|i| i.score).sum::<f64>() / n,
                avg_latency_ms: items.iter().map(|i| i.latency_ms).sum::<f64>() / n,
                total_cost: items.iter().map(|i| i.cost).sum::<f64>(),
                avg_cost: items.iter().map(|i| i.cost).sum::<f64>() / n,
                avg_tokens: items.iter().map(|i| i.tokens as f64).sum::<f64>() / n,
                success_rate: items.len() as f64 / samples_per_model as f64,
                samples: items.len(),
            })
        })
        .collect();
    metrics.sort_by(|a, b| {
        b.avg_score
            .partial_cmp(&a.avg_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let recommendations = generate_recommendations(&baseline, &metrics);

    if recommendations.verdict == Verdict::SwitchRecommended {
        if let Some(recommended) = recommendations.recommended_model() {
            let mut scores = Map::new();
            scores.insert("baseline".into(), serde_json::to_value(&baseline)?);
            scores.insert("candidates".into(), serde_json::to_value(&metrics)?);
            scores.insert("recommendations".into(), recommendations.to_value());
            let suggestion = Suggestion::model_swap(
                prompt.project_id,
                prompt.slug.clone(),
                recommended,
                scores,
            );
            store.insert_suggestion(&suggestion).await?;
            info!(
                prompt_id = %prompt_id_str,
                model = recommended,
                "backtest recommends model switch"
            );
        }
    }

    // The scheduler's threshold guard advances off this value.
    let scored_count_at_creation = job
        .result
        .parameters
        .get("scored_count_at_creation")
        .and_then(Value::as_i64)
        .unwrap_or(store.count_scored_spans(prompt_id_str).await?);

    let status = classify_partial(success_count, total_items);
    Ok(WorkerOutcome::with_status(status)
        .field("backtest_run_id", run_record.id.to_string())
        .field("current_model", current_model.unwrap_or_default())
        .field("baseline", serde_json::to_value(&baseline)?)
        .field("model_metrics", serde_json::to_value(&metrics)?)
        .field("recommendations", recommendations.to_value())
        .field("items_total", total_items)
        .field("items_succeeded", success_count)
        .field("scored_count_at_creation", scored_count_at_creation))
}

/// Replay one span on one candidate model, judge it, persist the
/// synthetic span.
/// Run one (span, model) backtest item and return its model name alongside the outcome.
async fn run_item_with_model(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    prompt: &tracetune::model::Prompt,
    prompt_id_str: &str,
    run_record: &BacktestRun,
    pair: (&Span, &String),
) -> (String, Result<ItemResult>) {
    let (span, model) = pair;
    let outcome = run_item(store, gateway, prompt, prompt_id_str, run_record, span, model).await;
    (model.clone(), outcome)
}

async fn run_item(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    prompt: &tracetune::model::Prompt,
    prompt_id_str: &str,
    run_record: &BacktestRun,
    span: &Span,
    model: &str,
) -> Result<ItemResult> {
    // A plain-text original must not be judged by the tool-call judge
    // just because the replay model chose differently.
    let original_was_plain = !matches!(
        span.metadata.response_type(),
        Some(ResponseType::ToolCalls)
    ) && !span.metadata.is_agentic();

    let replayed = replay_span(gateway, &prompt.prompt, span, Some(model)).await?;

    let judged_span = if original_was_plain {
        let mut stripped = span.clone();
        stripped.metadata.remove(meta_keys::RESPONSE_TYPE);
        stripped.metadata.remove(meta_keys::IS_AGENTIC);
        stripped
    } else {
        span.clone()
    };

    let judge_request = LlmRequest::text(judge_prompt(
        judge_kind_for(&judged_span),
        &prompt.evaluation_criteria,
        &span.input,
        &replayed.output,
    ))
    .with_json_response();
    let response = call_with_retry(gateway, judge_request, RetryPolicy::default()).await?;
    let score = parse_correctness(&response.content)?;

    let mut metadata = SpanMetadata(judged_span.metadata.0.clone());
    metadata.mark_backtest_replay(run_record.id);
    metadata.insert(meta_keys::REQUEST_MODEL, model);
    metadata.insert(meta_keys::RESPONSE_MODEL, model);
    metadata.insert("replay_correctness", score);
    metadata.insert("replayed_span_id", span.span_id.clone());
    metadata.insert(meta_keys::COST, replayed.stats.response_cost);

    let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let synthetic = Span {
        span_id: uuid::Uuid::new_v4().to_string(),
        trace_id: span.trace_id,
        parent_span_id: None,
        prompt_id: Some(prompt_id_str.to_string()),
        project_id: span.project_id,
        start_time_unix_nano: now_nanos,
        end_time_unix_nano: now_nanos + (replayed.stats.response_ms * 1_000_000.0) as i64,
        input: span.input.clone(),
        output: replayed.output.clone(),
        input_params: span.input_params.clone(),
        output_params: Value::Null,
        operation: format!("{OP_BACKTEST_PREFIX}{model}"),
        metadata,
        feedback_score: Default::default(),
        created_at: chrono::Utc::now(),
    };
    store.insert_span(&synthetic).await?;

    Ok(ItemResult {
        score,
        latency_ms: replayed.stats.response_ms,
        cost: replayed.stats.response_cost,
        tokens: replayed.stats.prompt_tokens + replayed.stats.completion_tokens,
    })
}
