//! Span - one observed LLM call, ingested from OpenTelemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Operation name given to replay spans created by prompt tuning.
pub const OP_PROMPT_TUNING: &str = "prompt_tuning";
/// Operation-name prefix for replay spans created by backtesting.
pub const OP_BACKTEST_PREFIX: &str = "backtest:";

/// Keys in `metadata_attributes` the engine relies on.
pub mod meta_keys {
    pub const IS_AGENTIC: &str = "is_agentic";
    pub const RESPONSE_TYPE: &str = "response_type";
    pub const AVAILABLE_TOOLS: &str = "available_tools";
    pub const COST: &str = "cost";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const PROMPT_IMPROVEMENT_TEST: &str = "prompt_improvement_test";
    pub const BACKTEST: &str = "backtest";
    pub const BACKTEST_RUN_ID: &str = "backtest_run_id";
}

/// How the model answered: structured tool calls or plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    ToolCalls,
    Text,
}

impl ResponseType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::ToolCalls => "tool_calls",
            ResponseType::Text => "text",
        }
    }
}

/// Typed view over the free-form `metadata_attributes` bag.
///
/// The bag carries arbitrary OTLP attributes; only the keys the engine
/// depends on get typed accessors, everything else passes through
/// untouched so the column round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanMetadata(pub Map<String, Value>);

impl SpanMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// A span with `response_type = "tool_calls"` is always treated as
    /// agentic, whatever `is_agentic` says.
    #[must_use]
    pub fn is_agentic(&self) -> bool {
        if matches!(self.response_type(), Some(ResponseType::ToolCalls)) {
            return true;
        }
        self.bool_value(meta_keys::IS_AGENTIC)
    }

    #[must_use]
    pub fn response_type(&self) -> Option<ResponseType> {
        match self.0.get(meta_keys::RESPONSE_TYPE).and_then(Value::as_str) {
            Some("tool_calls") => Some(ResponseType::ToolCalls),
            Some("text") => Some(ResponseType::Text),
            _ => None,
        }
    }

    /// Tool definitions the original call had available, if any.
    #[must_use]
    pub fn available_tools(&self) -> Vec<Value> {
        match self.0.get(meta_keys::AVAILABLE_TOOLS) {
            Some(Value::Array(tools)) => tools.clone(),
            // Some ingests store the tools array as a JSON string.
            Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Stored call cost in USD, when the ingest captured one.
    #[must_use]
    pub fn cost(&self) -> Option<f64> {
        self.0.get(meta_keys::COST).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn request_model(&self) -> Option<&str> {
        self.0.get(meta_keys::REQUEST_MODEL).and_then(Value::as_str)
    }

    #[must_use]
    pub fn response_model(&self) -> Option<&str> {
        self.0
            .get(meta_keys::RESPONSE_MODEL)
            .and_then(Value::as_str)
    }

    /// Token usage, tolerant of numeric strings and broken legacy values.
    #[must_use]
    pub fn token_usage(&self) -> (i64, i64) {
        (
            self.int_value(meta_keys::INPUT_TOKENS),
            self.int_value(meta_keys::OUTPUT_TOKENS),
        )
    }

    /// Sentinel check: replay span produced by tuning or backtesting.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.bool_value(meta_keys::PROMPT_IMPROVEMENT_TEST) || self.bool_value(meta_keys::BACKTEST)
    }

    /// Mark this metadata as a tuning replay.
    pub fn mark_tuning_replay(&mut self) {
        self.insert(meta_keys::PROMPT_IMPROVEMENT_TEST, true);
    }

    /// Mark this metadata as a backtest replay.
    pub fn mark_backtest_replay(&mut self, run_id: Uuid) {
        self.insert(meta_keys::BACKTEST, true);
        self.insert(meta_keys::BACKTEST_RUN_ID, run_id.to_string());
    }

    fn bool_value(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Tolerates ints, floats, and numeric strings; legacy broken values
    /// like `"False"` (from the old OTLP attribute parser) become 0.
    fn int_value(&self, key: &str) -> i64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// User and judge feedback stored in the `feedback_score` JSONB column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackScore {
    /// Judge-assigned correctness in `[0, 1]`; set by judge scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correctness: Option<f64>,
    /// Set by user action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_feedback: Option<Feedback>,
    /// Set by user action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_feedback: Option<Feedback>,
}

/// A thumbed rating with optional free text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub rating: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One observed (or replayed) LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// External 36-char string id.
    pub span_id: String,
    pub trace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Composite prompt id string, set by agent discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    pub project_id: Uuid,
    pub start_time_unix_nano: i64,
    pub end_time_unix_nano: i64,
    /// Message list or raw payload as ingested.
    #[serde(default)]
    pub input: Value,
    /// Span-format output: `[{role:"assistant", content, tool_calls?}]`.
    #[serde(default)]
    pub output: Value,
    /// Template variables extracted by discovery.
    #[serde(default)]
    pub input_params: Value,
    #[serde(default)]
    pub output_params: Value,
    pub operation: String,
    #[serde(default)]
    pub metadata: SpanMetadata,
    #[serde(default)]
    pub feedback_score: FeedbackScore,
    pub created_at: DateTime<Utc>,
}

impl Span {
    /// System-generated spans (tuning/backtest replays) are excluded from
    /// every eligibility count and all downstream analysis.
    #[must_use]
    pub fn is_system_generated(&self) -> bool {
        self.operation == OP_PROMPT_TUNING
            || self.operation.starts_with(OP_BACKTEST_PREFIX)
            || self.metadata.is_synthetic()
    }

    /// Whether judge scoring already set a correctness score.
    #[must_use]
    pub fn is_scored(&self) -> bool {
        self.feedback_score.correctness.is_some()
    }

    /// Wall-clock duration derived from the unix-nano timestamps.
    #[must_use]
    pub fn latency_ms(&self) -> f64 {
        (self.end_time_unix_nano - self.start_time_unix_nano) as f64 / 1_000_000.0
    }

    /// Timestamp helpers for age-window queries.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_nanos(self.start_time_unix_nano)
    }
}

/// Strip NUL (`\x00`) bytes recursively from every string in a JSON
/// value. Postgres JSONB rejects NULs inside strings, and some SDKs ship
/// them in extracted template variables.
#[must_use]
pub fn strip_nul_bytes(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace('\u{0}', "")),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nul_bytes).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.replace('\u{0}', ""), strip_nul_bytes(v)))
                .collect(),
        ),
        other => other,
    }
}
