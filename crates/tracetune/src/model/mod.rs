//! The persisted data model: jobs, prompts, spans, suggestions, and
//! backtest runs, with typed views over their JSON columns.

pub mod backtest;
pub mod job;
pub mod prompt;
pub mod span;
pub mod suggestion;

pub use backtest::{BacktestRun, BacktestStatus};
pub use job::{Job, JobResult, JobStatus, JobType};
pub use prompt::{
    content_hash, history_entry, AgentDescription, EvaluationCriteria, ImprovementMetadata,
    Prompt, PromptId,
};
pub use span::{
    meta_keys, strip_nul_bytes, Feedback, FeedbackScore, ResponseType, Span, SpanMetadata,
    OP_BACKTEST_PREFIX, OP_PROMPT_TUNING,
};
pub use suggestion::{Suggestion, SuggestionStatus};
