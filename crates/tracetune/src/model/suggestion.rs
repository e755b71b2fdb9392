//! Suggestion - a recommendation surfaced to the user: either a
//! prompt-version swap or a model swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Suggestion lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    #[default]
    Pending,
    Accepted,
    Dismissed,
}

impl SuggestionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "accepted" => Ok(SuggestionStatus::Accepted),
            "dismissed" => Ok(SuggestionStatus::Dismissed),
            other => Err(Error::InvalidData(format!(
                "unknown suggestion status: {other}"
            ))),
        }
    }
}

/// A recommendation created by the tuning or backtesting workers.
///
/// The kind is implicit in the populated fields: prompt swaps carry
/// `new_prompt_text` + `new_prompt_version`; model swaps carry
/// `scores["recommended_model"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub project_id: Uuid,
    pub prompt_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_prompt_version: Option<i32>,
    /// Scores summary; carries `recommended_model` for model swaps.
    #[serde(default)]
    pub scores: Map<String, Value>,
    pub status: SuggestionStatus,
    /// User vote in {-1, 0, +1}.
    #[serde(default)]
    pub vote: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Suggestion {
    /// A prompt-version-swap suggestion.
    #[must_use]
    pub fn prompt_swap(
        project_id: Uuid,
        prompt_slug: impl Into<String>,
        new_prompt_text: impl Into<String>,
        new_prompt_version: i32,
        scores: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            prompt_slug: prompt_slug.into(),
            new_prompt_text: Some(new_prompt_text.into()),
            new_prompt_version: Some(new_prompt_version),
            scores,
            status: SuggestionStatus::Pending,
            vote: 0,
            feedback: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A model-swap suggestion.
    #[must_use]
    pub fn model_swap(
        project_id: Uuid,
        prompt_slug: impl Into<String>,
        recommended_model: &str,
        mut scores: Map<String, Value>,
    ) -> Self {
        scores.insert(
            "recommended_model".to_string(),
            Value::String(recommended_model.to_string()),
        );
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            prompt_slug: prompt_slug.into(),
            new_prompt_text: None,
            new_prompt_version: None,
            scores,
            status: SuggestionStatus::Pending,
            vote: 0,
            feedback: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The recommended model, for model-swap suggestions.
    #[must_use]
    pub fn recommended_model(&self) -> Option<&str> {
        self.scores.get("recommended_model").and_then(Value::as_str)
    }

    /// Whether this is a prompt-version swap.
    #[must_use]
    pub fn is_prompt_swap(&self) -> bool {
        self.new_prompt_version.is_some()
    }
}
