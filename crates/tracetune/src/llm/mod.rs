//! LLM gateway: provider-agnostic calls with usage metrics.
//!
//! The engine never talks to a provider SDK directly; everything goes
//! through [`LlmGateway`], which returns the response content plus the
//! stats the workers persist (tokens, latency, cost). Tool-call
//! responses with no text are serialised to `{"tool_calls": [...]}` so
//! a single string channel carries both shapes; the normaliser converts
//! either into the span output format.

mod clients;
mod retry;

pub use clients::{ClientPool, HttpGateway};
pub use retry::{call_with_retry, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Supported models with their providers. The provider segment drives
/// routing and the interleaving used by backtest fan-out.
pub const SUPPORTED_MODELS: [(&str, &str); 16] = [
    ("openai", "gpt-5.2"),
    ("openai", "gpt-5-mini"),
    ("openai", "gpt-5-nano"),
    ("openai", "gpt-5.2-nano"),
    ("openai", "gpt-5.2-pro"),
    ("openai", "gpt-5"),
    ("openai", "gpt-4.1"),
    ("anthropic", "claude-opus-4-6"),
    ("anthropic", "claude-opus-4-5"),
    ("anthropic", "claude-sonnet-4-6"),
    ("anthropic", "claude-sonnet-4-5"),
    ("anthropic", "claude-haiku-4-5"),
    ("gemini", "gemini-3-pro-preview"),
    ("gemini", "gemini-3-flash-preview"),
    ("gemini", "gemini-2.5-flash"),
    ("gemini", "gemini-2.5-pro"),
];

/// Default model used when a caller does not pin one.
pub const DEFAULT_MODEL: &str = "gpt-5-mini";

/// Look up the provider for a (normalised) model name.
#[must_use]
pub fn provider_for_model(model: &str) -> Option<&'static str> {
    SUPPORTED_MODELS
        .iter()
        .find(|(_, name)| *name == model)
        .map(|(provider, _)| *provider)
}

/// Whether the model name is in the supported table.
#[must_use]
pub fn is_supported_model(model: &str) -> bool {
    provider_for_model(model).is_some()
}

/// Strip a date-version suffix (e.g. `-2025-08-07`) from a model name.
///
/// Span metadata often stores the fully-qualified name returned by the
/// provider (`gpt-5-mini-2025-08-07`); this maps it back to the base
/// name so it can be found in the supported table. Names that don't
/// resolve after stripping are returned as-is.
#[must_use]
pub fn normalize_model_name(model: &str) -> String {
    if let Some(base) = strip_date_suffix(model) {
        if is_supported_model(base) {
            return base.to_string();
        }
    }
    model.to_string()
}

fn strip_date_suffix(model: &str) -> Option<&str> {
    // Suffix shape: -YYYY-MM-DD (11 chars).
    if model.len() <= 11 {
        return None;
    }
    let (base, suffix) = model.split_at(model.len() - 11);
    let bytes = suffix.as_bytes();
    let digits_at = |range: std::ops::Range<usize>| {
        bytes[range].iter().all(u8::is_ascii_digit)
    };
    if bytes[0] == b'-'
        && digits_at(1..5)
        && bytes[5] == b'-'
        && digits_at(6..8)
        && bytes[8] == b'-'
        && digits_at(9..11)
    {
        Some(base)
    } else {
        None
    }
}

/// Structured-output hint forwarded to providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    /// Ask the model for a single JSON object.
    JsonObject,
}

/// One gateway invocation.
///
/// `messages` (when present) is used verbatim, which is how workers
/// replay a full conversation including tool-result turns; otherwise
/// the request is built from `input_text` + `system_prompt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

impl LlmRequest {
    /// A plain single-turn request.
    #[must_use]
    pub fn text(input: impl Into<String>) -> Self {
        Self {
            input_text: Some(input.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_json_response(mut self) -> Self {
        self.response_format = Some(ResponseFormat::JsonObject);
        self
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Value>) -> Self {
        self.messages = Some(messages);
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// The effective message list sent to the provider.
    #[must_use]
    pub fn effective_messages(&self) -> Vec<Value> {
        if let Some(ref messages) = self.messages {
            return messages.clone();
        }
        let mut out = Vec::new();
        if let Some(ref system) = self.system_prompt {
            out.push(serde_json::json!({"role": "system", "content": system}));
        }
        if let Some(ref input) = self.input_text {
            out.push(serde_json::json!({"role": "user", "content": input}));
        }
        out
    }
}

/// Usage metrics returned with every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub response_ms: f64,
    pub response_cost: f64,
}

/// The gateway's answer: content plus metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Plain text, or the serialised `{"tool_calls": [...]}` form.
    pub content: String,
    pub stats: CallStats,
}

/// Provider-agnostic LLM access.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Serialise provider tool calls into the single-string channel form.
#[must_use]
pub fn serialize_tool_calls(tool_calls: &Value) -> String {
    serde_json::json!({ "tool_calls": tool_calls }).to_string()
}

/// Convert gateway content into the span output format:
/// `[{role: "assistant", content, tool_calls?}]`.
///
/// Replay spans created by tuning and backtesting go through this so
/// they render identically to auto-captured traces.
#[must_use]
pub fn normalize_response_output(content: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
        if let Some(tool_calls) = map.get("tool_calls") {
            return serde_json::json!([{
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": tool_calls,
            }])
            .to_string();
        }
    }
    serde_json::json!([{ "role": "assistant", "content": content }]).to_string()
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_suffix_is_stripped_for_supported_models() {
        assert_eq!(normalize_model_name("gpt-5-mini-2025-08-07"), "gpt-5-mini");
        assert_eq!(
            normalize_model_name("claude-sonnet-4-6-2026-01-15"),
            "claude-sonnet-4-6"
        );
    }

    #[test]
    fn unknown_names_pass_through_untouched() {
        assert_eq!(normalize_model_name("my-finetune-2025-01-01"), "my-finetune-2025-01-01");
        assert_eq!(normalize_model_name("gpt-5-mini"), "gpt-5-mini");
        assert_eq!(normalize_model_name("short"), "short");
    }

    #[test]
    fn provider_lookup() {
        assert_eq!(provider_for_model("gpt-5-mini"), Some("openai"));
        assert_eq!(provider_for_model("claude-sonnet-4-6"), Some("anthropic"));
        assert_eq!(provider_for_model("gemini-2.5-flash"), Some("gemini"));
        assert_eq!(provider_for_model("llama-3"), None);
    }

    #[test]
    fn effective_messages_prefers_explicit_list() {
        let explicit = vec![serde_json::json!({"role": "user", "content": "hi"})];
        let req = LlmRequest::text("ignored")
            .with_system_prompt("ignored too")
            .with_messages(explicit.clone());
        assert_eq!(req.effective_messages(), explicit);
    }

    #[test]
    fn effective_messages_builds_from_parts() {
        let req = LlmRequest::text("What is 2+2?").with_system_prompt("Be terse.");
        let messages = req.effective_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "What is 2+2?");
    }

    #[test]
    fn normalize_wraps_plain_text() {
        let out = normalize_response_output("The answer is 4.");
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["role"], "assistant");
        assert_eq!(parsed[0]["content"], "The answer is 4.");
    }

    #[test]
    fn normalize_lifts_tool_calls() {
        let content = serialize_tool_calls(&serde_json::json!([
            {"id": "call_1", "function": {"name": "search", "arguments": "{}"}}
        ]));
        let out = normalize_response_output(&content);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["content"], Value::Null);
        assert_eq!(parsed[0]["tool_calls"][0]["id"], "call_1");
    }
}
