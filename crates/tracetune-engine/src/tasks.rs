//! Stable task names.
//!
//! External components enqueue by these literal strings, so they are
//! part of the wire contract and never derived.

use tracetune::model::{Job, JobType};

// Periodic sweeps (beat entries).
pub const DISCOVER_AGENTS: &str = "agent_discovery.discover_agents";
pub const EVALUATE_UNSCORED_SPANS: &str = "auto_evaluation.evaluate_unscored_spans";
pub const IMPROVE_PROMPT_TEMPLATES: &str = "prompt_improvement.improve_prompt_templates";
pub const CHECK_BACKTESTING_CANDIDATES: &str = "backtesting.check_backtesting_candidates";
pub const RECONCILE_PENDING_JOBS: &str = "job_reconciler.reconcile_pending_jobs";
pub const CLEANUP_OLD_JOBS: &str = "job_cleanup.cleanup_old_jobs";
pub const CHECK_REVIEW_TRIGGERS: &str = "periodic_reviews.check_review_triggers";

// Per-job workers (dispatched by the reconciler).
pub const RUN_AGENT_DISCOVERY: &str = "agent_discovery.run_agent_discovery";
pub const EVALUATE_PROMPT_SPANS: &str = "auto_evaluation.evaluate_prompt_spans";
pub const EVALUATE_SPANS: &str = "evaluations.evaluate_spans";
pub const IMPROVE_SINGLE_PROMPT: &str = "prompt_improvement.improve_single_prompt";
pub const RUN_MODEL_BACKTESTING: &str = "backtesting.run_model_backtesting";

// User-driven tasks.
pub const MARK_REVIEW_COMPLETED: &str = "periodic_reviews.mark_review_completed";

// Downstream tasks enqueued by discovery for each new prompt.
pub const GENERATE_CRITERIA: &str = "criteria_generator.generate";
pub const GENERATE_INITIAL_DESCRIPTION: &str =
    "agent_description_generator.generate_initial_description";

/// The worker task the reconciler dispatches for a job. Judge jobs with
/// an explicit span list use the span-list task; batch jobs use the
/// per-prompt one.
#[must_use]
pub fn worker_task_for(job: &Job) -> &'static str {
    match job.job_type {
        JobType::AgentDiscovery => RUN_AGENT_DISCOVERY,
        JobType::JudgeScoring => {
            if job.result.parameters.contains_key("span_ids") {
                EVALUATE_SPANS
            } else {
                EVALUATE_PROMPT_SPANS
            }
        }
        JobType::PromptTuning => IMPROVE_SINGLE_PROMPT,
        JobType::ModelBacktesting => RUN_MODEL_BACKTESTING,
    }
}
