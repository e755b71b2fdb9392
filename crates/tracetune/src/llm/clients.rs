//! Provider HTTP clients and the pooled gateway implementation.
//!
//! One [`HttpGateway`] serves all three providers; the model name picks
//! the route. Clients are pooled per (provider, base URL) in a bounded
//! LRU; evicted clients are closed off the caller's path.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    normalize_model_name, provider_for_model, serialize_tool_calls, CallStats, LlmGateway,
    LlmRequest, LlmResponse, ResponseFormat, DEFAULT_MODEL,
};
use crate::config::Settings;
use crate::error::{Error, Result};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_COMPLETION_TOKENS: u32 = 5000;

/// Per-million-token USD costs for the supported models. Unknown models
/// cost 0 and log a warning, matching how ingested spans without cost
/// metadata are treated.
const MODEL_COSTS: [(&str, f64, f64); 16] = [
    ("gpt-5.2", 1.75, 14.00),
    ("gpt-5-mini", 0.25, 2.00),
    ("gpt-5-nano", 0.05, 0.40),
    ("gpt-5.2-nano", 0.06, 0.48),
    ("gpt-5.2-pro", 21.00, 168.00),
    ("gpt-5", 1.25, 10.00),
    ("gpt-4.1", 2.00, 8.00),
    ("claude-opus-4-6", 5.00, 25.00),
    ("claude-opus-4-5", 5.00, 25.00),
    ("claude-sonnet-4-6", 3.00, 15.00),
    ("claude-sonnet-4-5", 3.00, 15.00),
    ("claude-haiku-4-5", 1.00, 5.00),
    ("gemini-3-pro-preview", 2.00, 12.00),
    ("gemini-3-flash-preview", 0.30, 2.50),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gemini-2.5-pro", 1.25, 10.00),
];

/// Cost of a call in USD given token usage, 0.0 for unknown models.
#[must_use]
pub fn usage_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    match MODEL_COSTS.iter().find(|(name, _, _)| *name == model) {
        Some((_, input, output)) => {
            let cost = (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1e6;
            (cost * 1e8).round() / 1e8
        }
        None => {
            warn!(model = %model, "unknown model for cost calculation");
            0.0
        }
    }
}

/// Bounded LRU of HTTP clients keyed by (provider, base URL).
///
/// Eviction hands the old client to a background task so teardown never
/// blocks the call path.
pub struct ClientPool {
    cache: Mutex<LruCache<String, reqwest::Client>>,
}

impl ClientPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch or build the client for a pool key.
    pub async fn get(&self, key: &str) -> Result<reqwest::Client> {
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(key) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Llm(format!("failed to build http client: {e}")))?;
        if let Some((evicted_key, evicted)) = cache.push(key.to_string(), client.clone()) {
            if evicted_key != key {
                tokio::spawn(async move { drop(evicted) });
            }
        }
        Ok(client)
    }

    /// Drop every pooled client.
    pub async fn close_all(&self) {
        let mut cache = self.cache.lock().await;
        cache.clear();
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(8)
    }
}

/// The production [`LlmGateway`]: routes by model provider over HTTP.
pub struct HttpGateway {
    pool: Arc<ClientPool>,
    openai_api_key: String,
    anthropic_api_key: String,
    gemini_api_key: String,
    openai_base: String,
    anthropic_base: String,
    gemini_base: String,
}

impl HttpGateway {
    /// Build from boot settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pool: Arc::new(ClientPool::default()),
            openai_api_key: settings.openai_api_key.clone(),
            anthropic_api_key: settings.anthropic_api_key.clone(),
            gemini_api_key: settings.gemini_api_key.clone(),
            openai_base: DEFAULT_OPENAI_BASE.to_string(),
            anthropic_base: DEFAULT_ANTHROPIC_BASE.to_string(),
            gemini_base: DEFAULT_GEMINI_BASE.to_string(),
        }
    }

    /// Override the OpenAI base URL (tests point this at a mock server).
    #[must_use]
    pub fn with_openai_base(mut self, base: impl Into<String>) -> Self {
        self.openai_base = base.into();
        self
    }

    /// Override the Anthropic base URL.
    #[must_use]
    pub fn with_anthropic_base(mut self, base: impl Into<String>) -> Self {
        self.anthropic_base = base.into();
        self
    }

    /// Override the Gemini base URL.
    #[must_use]
    pub fn with_gemini_base(mut self, base: impl Into<String>) -> Self {
        self.gemini_base = base.into();
        self
    }

    async fn call_openai(
        &self,
        model: &str,
        request: &LlmRequest,
    ) -> Result<(String, i64, i64)> {
        let client = self
            .pool
            .get(&format!("openai:{}", self.openai_base))
            .await?;

        let mut body = json!({
            "model": model,
            "messages": request.effective_messages(),
            "max_tokens": MAX_COMPLETION_TOKENS,
        });
        if matches!(request.response_format, Some(ResponseFormat::JsonObject)) {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(ref tools) = request.tools {
            body["tools"] = Value::Array(tools.clone());
        }

        let response = client
            .post(format!("{}/chat/completions", self.openai_base))
            .bearer_auth(&self.openai_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("openai request failed: {e}")))?;

        let payload = Self::check_status("openai", response).await?;

        let message = &payload["choices"][0]["message"];
        let content = match message["content"].as_str() {
            Some(text) => text.trim().to_string(),
            None => match message.get("tool_calls") {
                // Model responded with tool calls instead of plain text.
                Some(tool_calls) if !tool_calls.is_null() => serialize_tool_calls(tool_calls),
                _ => {
                    return Err(Error::Llm(
                        "no content or tool calls received from model".into(),
                    ))
                }
            },
        };

        let prompt_tokens = payload["usage"]["prompt_tokens"].as_i64().unwrap_or(0);
        let completion_tokens = payload["usage"]["completion_tokens"].as_i64().unwrap_or(0);
        Ok((content, prompt_tokens, completion_tokens))
    }

    async fn call_anthropic(
        &self,
        model: &str,
        request: &LlmRequest,
    ) -> Result<(String, i64, i64)> {
        let client = self
            .pool
            .get(&format!("anthropic:{}", self.anthropic_base))
            .await?;

        // The Messages API takes system text out-of-band.
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for msg in request.effective_messages() {
            match msg.get("role").and_then(Value::as_str) {
                Some("system") => {
                    if let Some(text) = msg.get("content").and_then(Value::as_str) {
                        system_parts.push(text.to_string());
                    }
                }
                _ => messages.push(msg),
            }
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": MAX_COMPLETION_TOKENS,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n"));
        }
        if let Some(ref tools) = request.tools {
            body["tools"] = Value::Array(tools.clone());
        }

        let response = client
            .post(format!("{}/v1/messages", self.anthropic_base))
            .header("x-api-key", &self.anthropic_api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("anthropic request failed: {e}")))?;

        let payload = Self::check_status("anthropic", response).await?;

        let blocks = payload["content"].as_array().cloned().unwrap_or_default();
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(text.to_string());
                    }
                }
                Some("tool_use") => tool_calls.push(json!({
                    "id": block.get("id"),
                    "type": "function",
                    "function": {
                        "name": block.get("name"),
                        "arguments": block.get("input").map(ToString::to_string),
                    }
                })),
                _ => {}
            }
        }
        let content = if text_parts.is_empty() && !tool_calls.is_empty() {
            serialize_tool_calls(&Value::Array(tool_calls))
        } else if text_parts.is_empty() {
            return Err(Error::Llm(
                "no content or tool calls received from model".into(),
            ));
        } else {
            text_parts.join("").trim().to_string()
        };

        let prompt_tokens = payload["usage"]["input_tokens"].as_i64().unwrap_or(0);
        let completion_tokens = payload["usage"]["output_tokens"].as_i64().unwrap_or(0);
        Ok((content, prompt_tokens, completion_tokens))
    }

    async fn call_gemini(&self, model: &str, request: &LlmRequest) -> Result<(String, i64, i64)> {
        let client = self
            .pool
            .get(&format!("gemini:{}", self.gemini_base))
            .await?;

        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for msg in request.effective_messages() {
            let text = msg
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match msg.get("role").and_then(Value::as_str) {
                Some("system") => system_parts.push(text),
                Some("assistant") => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": text}],
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": text}],
                })),
            }
        }

        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n")}]});
        }
        if matches!(request.response_format, Some(ResponseFormat::JsonObject)) {
            body["generationConfig"] = json!({"responseMimeType": "application/json"});
        }

        let response = client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.gemini_base, model
            ))
            .header("x-goog-api-key", &self.gemini_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("gemini request failed: {e}")))?;

        let payload = Self::check_status("gemini", response).await?;

        let content = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::Llm("no content received from model".into()))?;

        let prompt_tokens = payload["usageMetadata"]["promptTokenCount"]
            .as_i64()
            .unwrap_or(0);
        let completion_tokens = payload["usageMetadata"]["candidatesTokenCount"]
            .as_i64()
            .unwrap_or(0);
        Ok((content, prompt_tokens, completion_tokens))
    }

    async fn check_status(provider: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("{provider} response read failed: {e}")))?;
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::LlmRateLimited(format!("{provider}: {body}")));
        }
        if !status.is_success() {
            return Err(Error::Llm(format!("{provider} returned {status}: {body}")));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("{provider} returned malformed JSON: {e}")))
    }
}

#[async_trait::async_trait]
impl LlmGateway for HttpGateway {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse> {
        let model = request
            .model
            .as_deref()
            .map(normalize_model_name)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let provider = provider_for_model(&model)
            .ok_or_else(|| Error::Llm(format!("unsupported model: {model}")))?;

        debug!(model = %model, provider = %provider, "dispatching llm call");
        let started = Instant::now();
        let (content, prompt_tokens, completion_tokens) = match provider {
            "openai" => self.call_openai(&model, &request).await?,
            "anthropic" => self.call_anthropic(&model, &request).await?,
            "gemini" => self.call_gemini(&model, &request).await?,
            other => return Err(Error::Llm(format!("unknown provider: {other}"))),
        };
        let response_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(LlmResponse {
            content,
            stats: CallStats {
                prompt_tokens,
                completion_tokens,
                response_ms,
                response_cost: usage_cost(&model, prompt_tokens, completion_tokens),
            },
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_cost_for_known_model() {
        let cost = usage_cost("gpt-5-mini", 1_000_000, 1_000_000);
        assert!((cost - 2.25).abs() < 1e-9);
    }

    #[test]
    fn usage_cost_for_unknown_model_is_zero() {
        assert_eq!(usage_cost("mystery-model", 1000, 1000), 0.0);
    }

    #[tokio::test]
    async fn pool_evicts_beyond_capacity() {
        let pool = ClientPool::new(2);
        pool.get("openai:a").await.unwrap();
        pool.get("anthropic:b").await.unwrap();
        pool.get("gemini:c").await.unwrap();
        // Oldest entry was evicted; refetching it rebuilds a client
        // rather than erroring.
        pool.get("openai:a").await.unwrap();
        pool.close_all().await;
    }

    #[tokio::test]
    async fn unsupported_model_is_rejected_before_any_io() {
        let gateway = HttpGateway::from_settings(&Settings::from_env());
        let err = gateway
            .call(LlmRequest::text("hi").with_model("llama-unknown"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported model"));
    }
}
