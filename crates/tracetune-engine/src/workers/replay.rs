//! Conversation replay shared by prompt tuning and model backtesting.
//!
//! A replay preserves the original message list - user turns, tool
//! calls, tool results - and swaps only the system message for the
//! candidate template rendered with the span's own variables. That way
//! the model under test sees exactly the conversation the original
//! model saw.

use serde_json::{Map, Value};
use tracing::warn;

use tracetune::llm::{
    call_with_retry, normalize_model_name, normalize_response_output, CallStats, LlmGateway,
    LlmRequest, RetryPolicy, DEFAULT_MODEL,
};
use tracetune::model::Span;
use tracetune::template::render_with_json;
use tracetune::Result;

/// One replayed call.
#[derive(Debug, Clone)]
pub struct Replay {
    /// Model that produced the replay.
    pub model: String,
    /// Span-format output: `[{role:"assistant", content, tool_calls?}]`.
    pub output: Value,
    pub stats: CallStats,
}

/// Render the template with the span's variables, everything except the
/// reserved `tools` key.
fn render_for_span(template: &str, span: &Span) -> String {
    let params: Map<String, Value> = match &span.input_params {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "tools")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::String(raw) => match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(map) => map
                .into_iter()
                .filter(|(k, _)| k.as_str() != "tools")
                .collect(),
            Err(_) => Map::new(),
        },
        _ => Map::new(),
    };
    if params.is_empty() {
        return template.to_string();
    }
    render_with_json(template, &params)
}

/// Rebuild the message list with the system message replaced. A span
/// whose input is not a message list falls back to a single user turn.
fn rebuild_messages(span: &Span, formatted_prompt: &str) -> Option<Vec<Value>> {
    let Value::Array(original) = &span.input else {
        return None;
    };
    if original.is_empty() {
        return None;
    }

    let mut messages = Vec::with_capacity(original.len() + 1);
    let mut system_replaced = false;
    for message in original {
        let is_system = message.get("role").and_then(Value::as_str) == Some("system");
        if is_system && !system_replaced {
            messages.push(serde_json::json!({
                "role": "system",
                "content": formatted_prompt,
            }));
            system_replaced = true;
        } else {
            messages.push(message.clone());
        }
    }
    if !system_replaced {
        messages.insert(
            0,
            serde_json::json!({"role": "system", "content": formatted_prompt}),
        );
    }
    Some(messages)
}

/// Replay one span against `template` on `model_override` (or the
/// span's own model). The returned output is already in span format.
pub async fn replay_span(
    gateway: &dyn LlmGateway,
    template: &str,
    span: &Span,
    model_override: Option<&str>,
) -> Result<Replay> {
    let model = model_override
        .map(str::to_string)
        .or_else(|| span.metadata.response_model().map(normalize_model_name))
        .or_else(|| span.metadata.request_model().map(normalize_model_name))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let formatted = render_for_span(template, span);

    let mut request = LlmRequest::text(formatted.clone()).with_model(model.clone());
    if let Some(messages) = rebuild_messages(span, &formatted) {
        request = request.with_messages(messages);
    }
    let tools = span.metadata.available_tools();
    if !tools.is_empty() {
        request = request.with_tools(tools);
    }

    let response = call_with_retry(gateway, request, RetryPolicy::default()).await?;

    let output: Value = serde_json::from_str(&normalize_response_output(&response.content))
        .unwrap_or_else(|err| {
            warn!(span_id = %span.span_id, error = %err, "replay output not normalisable");
            Value::Null
        });

    Ok(Replay {
        model,
        output,
        stats: response.stats,
    })
}
