//! agent_discovery worker: groups unmapped spans into prompt templates.
//!
//! Scope is always a single project. Span mappings are committed before
//! any downstream enqueue so a crashed worker never leaves criteria
//! generation pointing at unmapped spans.

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use tracetune::llm::LlmGateway;
use tracetune::model::{strip_nul_bytes, Job, Prompt, PromptId, Span};
use tracetune::template::{match_template, TemplateExtractor, Variables};
use tracetune::{Result, Store};
use tracetune_broker::TaskBroker;

use super::WorkerOutcome;
use crate::tasks;

const SLUG_ADJECTIVES: [&str; 12] = [
    "amber", "brisk", "calm", "dapper", "eager", "fuzzy", "gentle", "keen", "lucid", "mellow",
    "nimble", "quiet",
];
const SLUG_NOUNS: [&str; 12] = [
    "falcon", "harbor", "juniper", "lantern", "meadow", "otter", "pebble", "quill", "reef",
    "sparrow", "thicket", "willow",
];

/// Canonical prompt text for a span: only `user` and `system` message
/// contents, joined by newlines. Assistant and tool turns are the
/// model's side of the conversation, not the prompt.
#[must_use]
pub fn extract_prompt_text(input: &Value) -> Option<String> {
    let messages = match input {
        Value::Array(messages) => messages.as_slice(),
        Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
        _ => return None,
    };

    let mut parts = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        if role != "user" && role != "system" {
            continue;
        }
        match message.get("content") {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                parts.push(text.trim().to_string());
            }
            // Part-list content: concatenate the text parts.
            Some(Value::Array(chunks)) => {
                for chunk in chunks {
                    if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            parts.push(text.trim().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Generate a slug unique within the project. Random word pair plus a
/// short hex tail, rechecked against existing slugs until free.
pub async fn generate_slug(store: &dyn Store, project_id: uuid::Uuid) -> Result<String> {
    use rand::seq::SliceRandom;

    loop {
        let (adjective, noun, tail) = {
            let mut rng = rand::thread_rng();
            let adjective = SLUG_ADJECTIVES.choose(&mut rng).copied().unwrap_or("amber");
            let noun = SLUG_NOUNS.choose(&mut rng).copied().unwrap_or("falcon");
            let tail: String = uuid::Uuid::new_v4().simple().to_string()[..4].to_string();
            (adjective, noun, tail)
        };
        let slug = format!("{adjective}-{noun}-{tail}");
        if !store.slug_exists(project_id, &slug).await? {
            return Ok(slug);
        }
    }
}

fn variables_to_params(variables: &Variables) -> Value {
    let map: Map<String, Value> = variables
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    // NULs inside extracted values break JSONB persistence downstream.
    strip_nul_bytes(Value::Object(map))
}

/// The discovery body. `_gateway` keeps the signature uniform with the
/// other workers; discovery itself makes no LLM calls - criteria and
/// description generation are enqueued as separate tasks.
pub async fn run(
    store: &dyn Store,
    broker: &dyn TaskBroker,
    extractor: &dyn TemplateExtractor,
    _gateway: &dyn LlmGateway,
    job: Job,
) -> Result<WorkerOutcome> {
    let project_id = job.project_id;
    let unmapped = store.list_unmapped_spans(project_id).await?;

    let mut texts: Vec<(usize, String)> = Vec::new();
    for (idx, span) in unmapped.iter().enumerate() {
        if let Some(text) = extract_prompt_text(&span.input) {
            texts.push((idx, text));
        }
    }

    if texts.is_empty() {
        return Ok(WorkerOutcome::completed()
            .field("new_templates", 0)
            .field("mapped", 0)
            .field("reason", "no unmapped spans with usable input"));
    }

    let mut mapped = 0usize;
    let mut matched_existing = 0usize;

    // Spans still unmatched after trying the project's known templates.
    let mut remainder: Vec<(usize, String)> = Vec::new();

    if store.any_mapped_spans(project_id).await? {
        let known = store.list_latest_prompts(project_id).await?;
        for (idx, text) in texts {
            match match_against_known(&known, &text) {
                Some((prompt_id, variables)) => {
                    let span = &unmapped[idx];
                    store
                        .set_span_mapping(
                            &span.span_id,
                            &prompt_id.to_string(),
                            &variables_to_params(&variables),
                        )
                        .await?;
                    mapped += 1;
                    matched_existing += 1;
                }
                None => remainder.push((idx, text)),
            }
        }
    } else {
        remainder = texts;
    }

    // Extract fresh templates from whatever the known set couldn't claim.
    let remainder_texts: Vec<&str> = remainder.iter().map(|(_, t)| t.as_str()).collect();
    let extracted = extractor.extract(&remainder_texts);

    let mut new_prompts: Vec<Prompt> = Vec::new();
    for template in &extracted {
        let hash = tracetune::model::content_hash(&template.text);
        let prompt = match store.find_prompt_by_hash(project_id, &hash).await? {
            // Same content seen before (eg. a re-run after a partial
            // crash): reuse instead of minting another version.
            Some(existing) => existing,
            None => {
                let slug = generate_slug(store, project_id).await?;
                let prompt = Prompt::new(project_id, slug, template.text.clone());
                store.insert_prompt(&prompt).await?;
                new_prompts.push(prompt.clone());
                prompt
            }
        };

        let prompt_id = prompt.prompt_id().to_string();
        for (local_idx, variables) in &template.matches {
            let span_idx = remainder[*local_idx].0;
            let span: &Span = &unmapped[span_idx];
            store
                .set_span_mapping(&span.span_id, &prompt_id, &variables_to_params(variables))
                .await?;
            mapped += 1;
        }
    }

    // Mappings are committed; downstream enqueues are fire-and-forget
    // at-least-once.
    for prompt in &new_prompts {
        let prompt_id = prompt.prompt_id().to_string();
        for task in [tasks::GENERATE_CRITERIA, tasks::GENERATE_INITIAL_DESCRIPTION] {
            if let Err(err) = broker
                .send_task(task, json!({ "prompt_id": prompt_id }))
                .await
            {
                warn!(task, prompt_id = %prompt_id, error = %err, "downstream enqueue failed");
            }
        }
    }

    info!(
        project_id = %project_id,
        new_templates = new_prompts.len(),
        mapped,
        "agent discovery finished"
    );

    let mut outcome = WorkerOutcome::completed()
        .field("new_templates", new_prompts.len())
        .field("mapped", mapped)
        .field("matched_existing", matched_existing);
    if new_prompts.is_empty() {
        outcome = outcome.field("reason", "no new templates discovered");
    }
    Ok(outcome)
}

fn match_against_known(known: &[Prompt], text: &str) -> Option<(PromptId, Variables)> {
    for prompt in known {
        if let Some(variables) = match_template(&prompt.prompt, text) {
            return Some((prompt.prompt_id(), variables));
        }
    }
    None
}
