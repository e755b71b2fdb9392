//! Prompt - a discovered or improved template (an "agent").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Composite prompt identity: `(project_id, slug, version)`.
///
/// Spans reference prompts through the derived string form
/// `"{project_uuid}_{version}_{slug}"`. The stored form must stay
/// parseable by external tools already deployed, so the codec keeps the
/// underscore layout; slugs themselves may contain underscores, which is
/// why parsing splits on the first two separators only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptId {
    pub project_id: Uuid,
    pub version: i32,
    pub slug: String,
}

impl PromptId {
    #[must_use]
    pub fn new(project_id: Uuid, version: i32, slug: impl Into<String>) -> Self {
        Self {
            project_id,
            version,
            slug: slug.into(),
        }
    }

    /// Parse the composite string form.
    pub fn parse(s: &str) -> Result<Self> {
        // UUIDs are fixed-width (36 chars), so split the first segment by
        // length rather than trusting underscore positions.
        if s.len() < 38 || !s.is_char_boundary(36) {
            return Err(Error::InvalidData(format!("malformed prompt id: {s}")));
        }
        let (uuid_part, rest) = s.split_at(36);
        let project_id = Uuid::parse_str(uuid_part)
            .map_err(|e| Error::InvalidData(format!("bad project uuid in prompt id: {e}")))?;
        let rest = rest
            .strip_prefix('_')
            .ok_or_else(|| Error::InvalidData(format!("malformed prompt id: {s}")))?;
        let (version_part, slug) = rest
            .split_once('_')
            .ok_or_else(|| Error::InvalidData(format!("malformed prompt id: {s}")))?;
        let version: i32 = version_part
            .parse()
            .map_err(|_| Error::InvalidData(format!("bad version in prompt id: {s}")))?;
        if slug.is_empty() {
            return Err(Error::InvalidData(format!("empty slug in prompt id: {s}")));
        }
        Ok(Self::new(project_id, version, slug))
    }
}

impl std::fmt::Display for PromptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.project_id, self.version, self.slug)
    }
}

/// Per-template judging criteria stored on the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationCriteria {
    /// Rules the judge scores correctness against.
    #[serde(default)]
    pub correctness: Vec<String>,
}

impl EvaluationCriteria {
    /// Whether the prompt carries any usable correctness rules.
    #[must_use]
    pub fn has_correctness(&self) -> bool {
        !self.correctness.is_empty()
    }
}

/// Review bookkeeping stored in the `agent_description` JSONB column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDescription {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub last_review_span_count: i64,
    /// Defaults to the first review threshold when never set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_span_count: Option<i64>,
    #[serde(default)]
    pub feedback_history: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_review_completed: Option<bool>,
}

/// Improvement bookkeeping stored in the `improvement_metadata` JSONB column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovementMetadata {
    #[serde(default)]
    pub last_improvement_span_count: i64,
    #[serde(default)]
    pub improvement_history: Vec<Value>,
    /// Set when criteria changed since the last improvement; cleared
    /// whenever a tuning attempt runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_invalidated: Option<bool>,
}

impl ImprovementMetadata {
    /// Record that a tuning attempt ran at `scored_count`, resetting the
    /// invalidation cycle.
    pub fn record_attempt(&mut self, scored_count: i64) {
        self.last_improvement_span_count = scored_count;
        self.criteria_invalidated = None;
    }
}

/// A discovered or improved template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub project_id: Uuid,
    pub slug: String,
    /// Monotonically increasing, starting at 1.
    pub version: i32,
    /// The template text, with `{var_N}` placeholders.
    pub prompt: String,
    /// Deterministic hash of `prompt`.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub evaluation_criteria: EvaluationCriteria,
    #[serde(default)]
    pub agent_description: AgentDescription,
    #[serde(default)]
    pub improvement_metadata: ImprovementMetadata,
    /// Exactly one version per (project, slug) should be active at a
    /// time - enforced by the accept-suggestion transaction, not the DB.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prompt {
    /// Build a fresh version-1 prompt from a template text.
    #[must_use]
    pub fn new(project_id: Uuid, slug: impl Into<String>, template: impl Into<String>) -> Self {
        let template = template.into();
        let now = Utc::now();
        Self {
            project_id,
            slug: slug.into(),
            version: 1,
            content_hash: content_hash(&template),
            prompt: template,
            display_name: None,
            tags: Vec::new(),
            evaluation_criteria: EvaluationCriteria::default(),
            agent_description: AgentDescription::default(),
            improvement_metadata: ImprovementMetadata::default(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Composite identity of this version.
    #[must_use]
    pub fn prompt_id(&self) -> PromptId {
        PromptId::new(self.project_id, self.version, self.slug.clone())
    }

    /// Derive the next version from this prompt with new template text.
    /// The new version starts inactive and inherits criteria and
    /// display name; improvement history is carried over so the worker
    /// can append to it.
    #[must_use]
    pub fn next_version(&self, new_text: impl Into<String>, version: i32) -> Prompt {
        let new_text = new_text.into();
        let now = Utc::now();
        Prompt {
            project_id: self.project_id,
            slug: self.slug.clone(),
            version,
            content_hash: content_hash(&new_text),
            prompt: new_text,
            display_name: self.display_name.clone(),
            tags: self.tags.clone(),
            evaluation_criteria: self.evaluation_criteria.clone(),
            agent_description: self.agent_description.clone(),
            improvement_metadata: self.improvement_metadata.clone(),
            is_active: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic content hash over template text (sha256 hex).
#[must_use]
pub fn content_hash(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append an entry to an improvement history list, keeping it JSON-shaped.
#[must_use]
pub fn history_entry(fields: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (k, v) in fields {
        map.insert((*k).to_string(), v.clone());
    }
    Value::Object(map)
}
