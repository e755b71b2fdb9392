//! Periodic agent reviews: UI badges asking the user to re-check a
//! prompt's scoring once enough new spans accumulated.
//!
//! Reviews are dismissible and never block any pipeline; this module
//! only detects threshold crossings and advances the bookkeeping when
//! the user completes or dismisses one.

use serde_json::{json, Value};
use tracing::{debug, info};

use tracetune::model::PromptId;
use tracetune::thresholds::next_review_threshold;
use tracetune::{Error, Result, Store};

/// First review fires at this many scored spans when a prompt has no
/// recorded threshold yet.
pub const DEFAULT_FIRST_REVIEW_AT: i64 = 100;

/// Sweep all latest prompts for crossed review thresholds.
pub async fn check_review_triggers(store: &dyn Store) -> Result<Value> {
    let mut prompts_checked = 0u64;
    let mut reviews_triggered = 0u64;
    let mut needing_review = Vec::new();

    for project_id in store.active_project_ids().await? {
        for prompt in store.list_latest_prompts(project_id).await? {
            prompts_checked += 1;

            let prompt_id = prompt.prompt_id().to_string();
            let span_count = store.count_scored_spans(&prompt_id).await?;
            if span_count == 0 {
                continue;
            }

            let next_due = prompt
                .agent_description
                .next_review_span_count
                .unwrap_or(DEFAULT_FIRST_REVIEW_AT);
            if span_count < next_due {
                continue;
            }

            debug!(prompt_id = %prompt_id, span_count, next_due, "review threshold reached");
            reviews_triggered += 1;
            needing_review.push(json!({
                "prompt_id": prompt_id,
                "slug": prompt.slug,
                "project_id": project_id.to_string(),
                "span_count": span_count,
                "display_name": prompt.display_name,
            }));
        }
    }

    info!(prompts_checked, reviews_triggered, "periodic review check finished");
    Ok(json!({
        "prompts_checked": prompts_checked,
        "reviews_triggered": reviews_triggered,
        "prompts_needing_review": needing_review,
    }))
}

/// Record a completed (or dismissed) review and advance the threshold.
///
/// Idempotent: repeating the call with the same count recomputes the
/// same next threshold, so a double-submitting client cannot regress
/// the schedule.
pub async fn mark_review_completed(
    store: &dyn Store,
    prompt_id: &str,
    current_span_count: i64,
) -> Result<Value> {
    let id = PromptId::parse(prompt_id)?;
    let mut prompt = store
        .get_prompt(id.project_id, &id.slug, id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id}")))?;

    let next = next_review_threshold(current_span_count);
    prompt.agent_description.last_review_span_count = current_span_count;
    prompt.agent_description.next_review_span_count = Some(next);
    store.update_prompt(&prompt).await?;

    info!(prompt_id = %prompt_id, last = current_span_count, next, "review completed");
    Ok(json!({"success": true, "next_review_threshold": next}))
}

/// Record that the initial review of a freshly discovered prompt is
/// done. Safe to call repeatedly.
pub async fn mark_initial_review_complete(store: &dyn Store, prompt_id: &str) -> Result<Value> {
    let id = PromptId::parse(prompt_id)?;
    let mut prompt = store
        .get_prompt(id.project_id, &id.slug, id.version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {prompt_id}")))?;

    if prompt.agent_description.initial_review_completed != Some(true) {
        prompt.agent_description.initial_review_completed = Some(true);
        store.update_prompt(&prompt).await?;
    }
    Ok(json!({"success": true}))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scored_span, seeded_prompt};
    use tracetune::testing::MemoryStore;

    #[tokio::test]
    async fn review_triggers_at_default_first_threshold() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..100 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }

        let stats = check_review_triggers(&store).await.unwrap();
        assert_eq!(stats["reviews_triggered"], 1);
        assert_eq!(
            stats["prompts_needing_review"][0]["slug"],
            "checkout"
        );
    }

    #[tokio::test]
    async fn below_threshold_triggers_nothing() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..40 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }
        let stats = check_review_triggers(&store).await.unwrap();
        assert_eq!(stats["reviews_triggered"], 0);
    }

    #[tokio::test]
    async fn completion_advances_and_is_idempotent() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let prompt_id = prompt.prompt_id().to_string();

        let first = mark_review_completed(&store, &prompt_id, 120).await.unwrap();
        assert_eq!(first["next_review_threshold"], 200);

        // Repeat with the same count: same answer, nothing regresses.
        let second = mark_review_completed(&store, &prompt_id, 120).await.unwrap();
        assert_eq!(second["next_review_threshold"], 200);

        let stored = store
            .get_prompt(prompt.project_id, &prompt.slug, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.agent_description.last_review_span_count, 120);
        assert_eq!(stored.agent_description.next_review_span_count, Some(200));
    }

    #[tokio::test]
    async fn completed_review_silences_the_trigger() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        for i in 0..100 {
            store.add_span(scored_span(&prompt, i, 0.8)).await;
        }
        mark_review_completed(&store, &prompt.prompt_id().to_string(), 100)
            .await
            .unwrap();

        let stats = check_review_triggers(&store).await.unwrap();
        assert_eq!(stats["reviews_triggered"], 0);
    }

    #[tokio::test]
    async fn initial_review_completion_is_idempotent() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let prompt_id = prompt.prompt_id().to_string();

        mark_initial_review_complete(&store, &prompt_id).await.unwrap();
        mark_initial_review_complete(&store, &prompt_id).await.unwrap();

        let stored = store
            .get_prompt(prompt.project_id, &prompt.slug, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.agent_description.initial_review_completed, Some(true));
    }

    #[tokio::test]
    async fn unknown_prompt_errors() {
        let store = MemoryStore::new();
        let bogus = format!("{}_1_ghost", uuid::Uuid::new_v4());
        assert!(mark_review_completed(&store, &bogus, 10).await.is_err());
    }
}
