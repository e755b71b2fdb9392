//! Judge and improvement prompt text plus default criteria.
//!
//! The judge prompt is selected by how the original span answered:
//! tool-call spans are judged on tool selection, tool-answer spans on
//! how tool results were used, legacy agentic spans on the combined
//! behavior, and plain spans on the response alone.

use serde_json::Value;

use tracetune::model::{EvaluationCriteria, ResponseType, Span};

/// How a span gets judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeKind {
    ToolCall,
    ToolAnswer,
    Agentic,
    Plain,
}

/// Pick the judge for a span. `tool_calls` responses are always
/// agentic, whatever `is_agentic` says; `text` responses from agentic
/// spans are judged as tool answers; agentic spans without a
/// `response_type` fall back to the legacy agentic judge.
#[must_use]
pub fn judge_kind_for(span: &Span) -> JudgeKind {
    match span.metadata.response_type() {
        Some(ResponseType::ToolCalls) => JudgeKind::ToolCall,
        Some(ResponseType::Text) if span.metadata.is_agentic() => JudgeKind::ToolAnswer,
        Some(ResponseType::Text) => JudgeKind::Plain,
        None if span.metadata.is_agentic() => JudgeKind::Agentic,
        None => JudgeKind::Plain,
    }
}

/// Default criteria when the prompt carries none, per judge kind.
#[must_use]
pub fn default_criteria(kind: JudgeKind) -> EvaluationCriteria {
    let rules = match kind {
        JudgeKind::ToolCall => vec![
            "The selected tool must be appropriate for the user's request".to_string(),
            "Tool arguments must be complete and consistent with the conversation".to_string(),
        ],
        JudgeKind::ToolAnswer => vec![
            "The answer must correctly use the information returned by the tools".to_string(),
            "The answer must address the user's original request".to_string(),
        ],
        JudgeKind::Agentic => vec![
            "The response must be accurate and address the user's request".to_string(),
            "Any tool usage must be appropriate and correctly incorporated".to_string(),
        ],
        JudgeKind::Plain => vec![
            "The response must be accurate and address the user's request".to_string(),
        ],
    };
    EvaluationCriteria { correctness: rules }
}

/// Addendum appended to legacy agentic criteria that never mention tools.
pub const AGENTIC_TOOL_ADDENDUM: &str =
    "Also judge whether any tool calls were appropriate and their results correctly used.";

const JUDGE_TOOL_CALL: &str = "You are evaluating one LLM call that responded with tool calls.\n\
Judge whether the tool selection and arguments are correct given the conversation.\n\n\
Criteria:\n{criteria}\n\nConversation input:\n{input}\n\nModel response:\n{output}\n\n\
Respond with a JSON object: {\"correctness\": <float between 0.0 and 1.0>}";

const JUDGE_TOOL_ANSWER: &str = "You are evaluating one LLM call that answered after using tools.\n\
Judge whether the final answer correctly uses the tool results and addresses the request.\n\n\
Criteria:\n{criteria}\n\nConversation input:\n{input}\n\nModel response:\n{output}\n\n\
Respond with a JSON object: {\"correctness\": <float between 0.0 and 1.0>}";

const JUDGE_AGENTIC: &str = "You are evaluating one call made by an LLM agent.\n\
Judge the response against the criteria, considering any tool activity in the conversation.\n\n\
Criteria:\n{criteria}\n\nConversation input:\n{input}\n\nModel response:\n{output}\n\n\
Respond with a JSON object: {\"correctness\": <float between 0.0 and 1.0>}";

const JUDGE_PLAIN: &str = "You are evaluating one LLM call.\n\
Judge the response against the criteria.\n\n\
Criteria:\n{criteria}\n\nConversation input:\n{input}\n\nModel response:\n{output}\n\n\
Respond with a JSON object: {\"correctness\": <float between 0.0 and 1.0>}";

/// Render the judge prompt for a span.
#[must_use]
pub fn judge_prompt(
    kind: JudgeKind,
    criteria: &EvaluationCriteria,
    input: &Value,
    output: &Value,
) -> String {
    let template = match kind {
        JudgeKind::ToolCall => JUDGE_TOOL_CALL,
        JudgeKind::ToolAnswer => JUDGE_TOOL_ANSWER,
        JudgeKind::Agentic => JUDGE_AGENTIC,
        JudgeKind::Plain => JUDGE_PLAIN,
    };
    let mut rules = criteria.correctness.clone();
    if kind == JudgeKind::Agentic
        && !rules
            .iter()
            .any(|r| r.to_lowercase().contains("tool"))
    {
        rules.push(AGENTIC_TOOL_ADDENDUM.to_string());
    }
    template
        .replace("{criteria}", &format_rules(&rules))
        .replace("{input}", &compact(input))
        .replace("{output}", &compact(output))
}

fn format_rules(rules: &[String]) -> String {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| format!("{}. {rule}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Prompt asking for improvement suggestions from poor examples.
#[must_use]
pub fn suggestion_prompt(current_prompt: &str, poor_examples: &str, tool_aware: bool) -> String {
    if tool_aware {
        format!(
            "The following prompt template drives an LLM agent that can call tools.\n\n\
             Current template:\n{current_prompt}\n\n\
             Low-scoring calls (tool definitions included for context, do not change them):\n\
             {poor_examples}\n\n\
             List concrete, specific changes to the template that would raise correctness \
             on calls like these. Focus on instructions, not tools."
        )
    } else {
        format!(
            "The following prompt template drives an LLM application.\n\n\
             Current template:\n{current_prompt}\n\n\
             Low-scoring calls:\n{poor_examples}\n\n\
             List concrete, specific changes to the template that would raise correctness \
             on calls like these."
        )
    }
}

/// Prompt producing the improved template text.
#[must_use]
pub fn improvement_prompt(
    current_prompt: &str,
    suggestions: &str,
    good_examples: &str,
    poor_examples: &str,
) -> String {
    format!(
        "Rewrite the prompt template below, applying the suggested changes while preserving \
         every {{placeholder}} exactly as written.\n\n\
         Current template:\n{current_prompt}\n\n\
         Suggested changes:\n{suggestions}\n\n\
         High-scoring calls for reference:\n{good_examples}\n\n\
         Low-scoring calls to fix:\n{poor_examples}\n\n\
         Respond with the improved template text only, no commentary."
    )
}

/// Render up to `limit` spans as example text for the improvement prompts.
#[must_use]
pub fn format_span_examples(spans: &[Span], limit: usize) -> String {
    spans
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, span)| {
            let score = span
                .feedback_score
                .correctness
                .map(|s| format!("{s:.2}"))
                .unwrap_or_else(|| "unscored".to_string());
            format!(
                "--- example {} (correctness {score}) ---\ninput: {}\noutput: {}",
                i + 1,
                compact(&span.input),
                compact(&span.output)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
