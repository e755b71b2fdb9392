//! Shared fixtures for the engine test suites.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use tracetune::model::{FeedbackScore, Prompt, Span, SpanMetadata};
use tracetune::testing::MemoryStore;

/// Insert a project + a version-1 prompt with correctness criteria.
pub async fn seeded_prompt(store: &MemoryStore, slug: &str) -> Prompt {
    let project = Uuid::new_v4();
    store.add_project(project).await;
    let mut prompt = Prompt::new(project, slug, "Answer the question: {var_0}");
    prompt.evaluation_criteria.correctness = vec!["Must be accurate".to_string()];
    store.add_prompt(prompt.clone()).await;
    prompt
}

/// A recent span linked to `prompt`, not yet scored.
pub fn unscored_span(prompt: &Prompt, seq: i64) -> Span {
    let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    Span {
        span_id: Uuid::new_v4().to_string(),
        trace_id: Uuid::new_v4(),
        parent_span_id: None,
        prompt_id: Some(prompt.prompt_id().to_string()),
        project_id: prompt.project_id,
        start_time_unix_nano: now_nanos - seq * 1_000_000,
        end_time_unix_nano: now_nanos - seq * 1_000_000 + 800_000_000,
        input: json!([
            {"role": "system", "content": "You are helpful."},
            {"role": "user", "content": format!("Question number {seq}?")}
        ]),
        output: json!([{"role": "assistant", "content": format!("Answer {seq}.")}]),
        input_params: json!({"var_0": format!("question {seq}")}),
        output_params: Value::Null,
        operation: "chat.completions".to_string(),
        metadata: span_metadata("gpt-5-mini"),
        feedback_score: FeedbackScore::default(),
        created_at: Utc::now(),
    }
}

/// A recent scored span linked to `prompt`.
pub fn scored_span(prompt: &Prompt, seq: i64, correctness: f64) -> Span {
    let mut span = unscored_span(prompt, seq);
    span.feedback_score.correctness = Some(correctness);
    span
}

/// Metadata carrying model + usage + cost like an ingested span.
pub fn span_metadata(model: &str) -> SpanMetadata {
    let mut meta = SpanMetadata::new();
    meta.insert("gen_ai.request.model", model);
    meta.insert("gen_ai.response.model", model);
    meta.insert("gen_ai.usage.input_tokens", 500);
    meta.insert("gen_ai.usage.output_tokens", 100);
    meta.insert("cost", 0.0004);
    meta
}
