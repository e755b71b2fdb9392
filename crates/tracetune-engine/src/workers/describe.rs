//! Downstream tasks enqueued by discovery for every new prompt:
//! criteria generation and the initial agent description.
//!
//! Both are fire-and-forget at-least-once, so they must tolerate
//! re-delivery: criteria are only written while still empty, and the
//! description write is a plain overwrite of identical content.

use serde_json::{json, Value};
use tracing::info;

use tracetune::llm::{call_with_retry, LlmGateway, LlmRequest, RetryPolicy};
use tracetune::model::PromptId;
use tracetune::thresholds::next_review_threshold;
use tracetune::{Error, Result, Store};

/// Sample size of mapped spans shown to the generator prompts.
const EXAMPLE_SPANS: i64 = 5;

/// Generate correctness criteria for a freshly discovered prompt.
pub async fn generate_criteria(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    prompt_id: &str,
) -> Result<Value> {
    let id = PromptId::parse(prompt_id)?;
    let mut prompt = store
        .get_prompt(id.project_id, &id.slug, id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id}")))?;

    if prompt.evaluation_criteria.has_correctness() {
        // Re-delivered task or user already wrote criteria: keep theirs.
        return Ok(json!({"status": "kept_existing"}));
    }

    let examples = store.list_unscored_spans(prompt_id, EXAMPLE_SPANS).await?;
    let example_text = crate::prompts::format_span_examples(&examples, EXAMPLE_SPANS as usize);

    let request = LlmRequest::text(format!(
        "This prompt template drives an LLM application:\n\n{}\n\n\
         Example calls:\n{example_text}\n\n\
         Write 2-4 short correctness rules a judge can score responses against.\n\
         Respond with a JSON object: {{\"correctness\": [\"rule\", ...]}}",
        prompt.prompt
    ))
    .with_json_response();
    let response = call_with_retry(gateway, request, RetryPolicy::default()).await?;

    let parsed: Value = serde_json::from_str(&response.content)
        .map_err(|e| Error::Llm(format!("criteria generator returned malformed JSON: {e}")))?;
    let rules: Vec<String> = parsed
        .get("correctness")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if rules.is_empty() {
        return Err(Error::Llm("criteria generator returned no rules".into()));
    }

    prompt.evaluation_criteria.correctness = rules.clone();
    store.update_prompt(&prompt).await?;

    info!(prompt_id = %prompt_id, rules = rules.len(), "generated evaluation criteria");
    Ok(json!({"status": "generated", "rules": rules.len()}))
}

/// Generate the initial agent description and seed the review ladder.
pub async fn generate_initial_description(
    store: &dyn Store,
    gateway: &dyn LlmGateway,
    prompt_id: &str,
) -> Result<Value> {
    let id = PromptId::parse(prompt_id)?;
    let mut prompt = store
        .get_prompt(id.project_id, &id.slug, id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id}")))?;

    let request = LlmRequest::text(format!(
        "Describe in one or two sentences what this prompt template does, \
         for a dashboard listing:\n\n{}",
        prompt.prompt
    ));
    let response = call_with_retry(gateway, request, RetryPolicy::default()).await?;

    prompt.agent_description.description = response.content.trim().to_string();
    if prompt.agent_description.next_review_span_count.is_none() {
        prompt.agent_description.next_review_span_count = Some(next_review_threshold(0));
    }
    store.update_prompt(&prompt).await?;

    info!(prompt_id = %prompt_id, "generated initial agent description");
    Ok(json!({"status": "generated"}))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_prompt;
    use tracetune::testing::{MemoryStore, MockGateway};

    #[tokio::test]
    async fn criteria_generation_fills_empty_criteria_only() {
        let store = MemoryStore::new();
        let mut prompt = seeded_prompt(&store, "checkout").await;
        prompt.evaluation_criteria.correctness.clear();
        store.update_prompt(&prompt).await.unwrap();
        let prompt_id = prompt.prompt_id().to_string();

        let gateway = MockGateway::new()
            .with_default_text(r#"{"correctness": ["Must be accurate", "Must cite the order id"]}"#);
        let result = generate_criteria(&store, &gateway, &prompt_id).await.unwrap();
        assert_eq!(result["status"], "generated");

        let stored = store
            .get_prompt(prompt.project_id, "checkout", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.evaluation_criteria.correctness.len(), 2);

        // Re-delivery keeps what exists.
        let again = generate_criteria(&store, &gateway, &prompt_id).await.unwrap();
        assert_eq!(again["status"], "kept_existing");
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn initial_description_seeds_review_ladder() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let prompt_id = prompt.prompt_id().to_string();

        let gateway = MockGateway::new().with_default_text("Answers checkout questions.");
        generate_initial_description(&store, &gateway, &prompt_id)
            .await
            .unwrap();

        let stored = store
            .get_prompt(prompt.project_id, "checkout", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.agent_description.description, "Answers checkout questions.");
        assert_eq!(stored.agent_description.next_review_span_count, Some(10));
    }
}
