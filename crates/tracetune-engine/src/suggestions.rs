//! Suggestion lifecycle and the criteria-change invalidation hook.
//!
//! Accepting a prompt-swap suggestion is a single transaction that
//! deactivates every version of the (project, slug) and activates the
//! target, so exactly one version is active afterwards. Accepting
//! twice is a no-op; dismissing an accepted suggestion never
//! re-deactivates versions.

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use tracetune::model::{EvaluationCriteria, SuggestionStatus};
use tracetune::thresholds::invalidate_improvement_metadata;
use tracetune::{Error, Result, Store};

/// Accept a suggestion. Returns false when it was already accepted
/// (idempotent second call).
pub async fn accept_suggestion(store: &dyn Store, suggestion_id: Uuid) -> Result<bool> {
    let mut suggestion = store
        .get_suggestion(suggestion_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("suggestion {suggestion_id}")))?;

    if suggestion.status == SuggestionStatus::Accepted {
        return Ok(false);
    }

    if let Some(version) = suggestion.new_prompt_version {
        store
            .set_active_version(suggestion.project_id, &suggestion.prompt_slug, version)
            .await?;
        info!(
            suggestion_id = %suggestion_id,
            slug = %suggestion.prompt_slug,
            version,
            "activated suggested prompt version"
        );
    }
    // Model swaps only record the acceptance; the actual routing change
    // happens in the caller's own configuration.

    suggestion.status = SuggestionStatus::Accepted;
    store.update_suggestion(&suggestion).await?;
    Ok(true)
}

/// Dismiss a suggestion, optionally with a vote and feedback text.
/// Never touches prompt versions, even when the suggestion had been
/// accepted earlier.
pub async fn dismiss_suggestion(
    store: &dyn Store,
    suggestion_id: Uuid,
    vote: Option<i32>,
    feedback: Option<String>,
) -> Result<()> {
    let mut suggestion = store
        .get_suggestion(suggestion_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("suggestion {suggestion_id}")))?;

    suggestion.status = SuggestionStatus::Dismissed;
    if let Some(vote) = vote {
        suggestion.vote = vote.clamp(-1, 1);
    }
    if feedback.is_some() {
        suggestion.feedback = feedback;
    }
    store.update_suggestion(&suggestion).await
}

/// Apply a user edit to a prompt's evaluation criteria.
///
/// Rolls `last_improvement_span_count` back one threshold step (once
/// per cycle) so the next tuning attempt runs with the new criteria.
pub async fn apply_criteria_edit(
    store: &dyn Store,
    project_id: Uuid,
    slug: &str,
    criteria: EvaluationCriteria,
) -> Result<()> {
    let mut prompt = store
        .find_latest_prompt(project_id, slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {project_id}/{slug}")))?;

    prompt.evaluation_criteria = criteria;
    let rolled_back = invalidate_improvement_metadata(&mut prompt.improvement_metadata);
    store.update_prompt(&prompt).await?;

    if rolled_back {
        info!(
            slug = %slug,
            last = prompt.improvement_metadata.last_improvement_span_count,
            "criteria edit rolled improvement counter back"
        );
    }
    Ok(())
}

/// Apply a user edit to a prompt's agent description. Same invalidation
/// semantics as a criteria edit - the description feeds the improvement
/// prompts too.
pub async fn apply_description_edit(
    store: &dyn Store,
    project_id: Uuid,
    slug: &str,
    description: String,
    feedback: Option<Value>,
) -> Result<()> {
    let mut prompt = store
        .find_latest_prompt(project_id, slug)
        .await?
        .ok_or_else(|| Error::NotFound(format!("prompt {project_id}/{slug}")))?;

    prompt.agent_description.description = description;
    if let Some(feedback) = feedback {
        prompt.agent_description.feedback_history.push(feedback);
    }
    invalidate_improvement_metadata(&mut prompt.improvement_metadata);
    store.update_prompt(&prompt).await
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_prompt;
    use serde_json::Map;
    use tracetune::model::Suggestion;
    use tracetune::testing::MemoryStore;

    #[tokio::test]
    async fn accepting_prompt_swap_activates_exactly_one_version() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let v2 = prompt.next_version("better {var_0}", 2);
        store.add_prompt(v2.clone()).await;

        let suggestion = Suggestion::prompt_swap(
            prompt.project_id,
            "checkout",
            v2.prompt.clone(),
            2,
            Map::new(),
        );
        store.insert_suggestion(&suggestion).await.unwrap();

        assert!(accept_suggestion(&store, suggestion.id).await.unwrap());

        let v1 = store
            .get_prompt(prompt.project_id, "checkout", 1)
            .await
            .unwrap()
            .unwrap();
        let v2 = store
            .get_prompt(prompt.project_id, "checkout", 2)
            .await
            .unwrap()
            .unwrap();
        assert!(!v1.is_active);
        assert!(v2.is_active);
    }

    #[tokio::test]
    async fn accepting_twice_is_a_noop() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let v2 = prompt.next_version("better {var_0}", 2);
        store.add_prompt(v2).await;

        let suggestion =
            Suggestion::prompt_swap(prompt.project_id, "checkout", "better", 2, Map::new());
        store.insert_suggestion(&suggestion).await.unwrap();

        assert!(accept_suggestion(&store, suggestion.id).await.unwrap());
        assert!(!accept_suggestion(&store, suggestion.id).await.unwrap());
    }

    #[tokio::test]
    async fn dismissing_accepted_suggestion_keeps_versions() {
        let store = MemoryStore::new();
        let prompt = seeded_prompt(&store, "checkout").await;
        let v2 = prompt.next_version("better {var_0}", 2);
        store.add_prompt(v2).await;

        let suggestion =
            Suggestion::prompt_swap(prompt.project_id, "checkout", "better", 2, Map::new());
        store.insert_suggestion(&suggestion).await.unwrap();
        accept_suggestion(&store, suggestion.id).await.unwrap();

        dismiss_suggestion(&store, suggestion.id, Some(-1), Some("changed my mind".into()))
            .await
            .unwrap();

        // Status flipped, but v2 stays active.
        let stored = store.get_suggestion(suggestion.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Dismissed);
        assert_eq!(stored.vote, -1);
        let v2 = store
            .get_prompt(prompt.project_id, "checkout", 2)
            .await
            .unwrap()
            .unwrap();
        assert!(v2.is_active);
    }

    #[tokio::test]
    async fn criteria_edit_rolls_back_one_threshold_step() {
        let store = MemoryStore::new();
        let mut prompt = seeded_prompt(&store, "checkout").await;
        prompt.improvement_metadata.last_improvement_span_count = 120;
        store.update_prompt(&prompt).await.unwrap();

        apply_criteria_edit(
            &store,
            prompt.project_id,
            "checkout",
            EvaluationCriteria {
                correctness: vec!["New rule".into()],
            },
        )
        .await
        .unwrap();

        let stored = store
            .find_latest_prompt(prompt.project_id, "checkout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.improvement_metadata.last_improvement_span_count, 50);
        assert_eq!(stored.improvement_metadata.criteria_invalidated, Some(true));
        assert_eq!(stored.evaluation_criteria.correctness, vec!["New rule"]);

        // A second edit in the same cycle does not decrement again.
        apply_criteria_edit(
            &store,
            prompt.project_id,
            "checkout",
            EvaluationCriteria {
                correctness: vec!["Another rule".into()],
            },
        )
        .await
        .unwrap();
        let stored = store
            .find_latest_prompt(prompt.project_id, "checkout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.improvement_metadata.last_improvement_span_count, 50);
    }

    #[tokio::test]
    async fn missing_suggestion_errors() {
        let store = MemoryStore::new();
        assert!(accept_suggestion(&store, Uuid::new_v4()).await.is_err());
        assert!(dismiss_suggestion(&store, Uuid::new_v4(), None, None)
            .await
            .is_err());
    }
}
