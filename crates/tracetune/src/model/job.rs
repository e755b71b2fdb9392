//! Job - the durable record of a unit of background work.
//!
//! A job is the single source of truth for orchestration state: the
//! scheduler inserts it as `pending`, the reconciler flips it to
//! `running` when it dispatches the broker task, and the worker owns
//! every mutation from then until a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The four background job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    AgentDiscovery,
    JudgeScoring,
    PromptTuning,
    ModelBacktesting,
}

impl JobType {
    /// All job types, in scheduling order.
    pub const ALL: [JobType; 4] = [
        JobType::AgentDiscovery,
        JobType::JudgeScoring,
        JobType::PromptTuning,
        JobType::ModelBacktesting,
    ];

    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::AgentDiscovery => "agent_discovery",
            JobType::JudgeScoring => "judge_scoring",
            JobType::PromptTuning => "prompt_tuning",
            JobType::ModelBacktesting => "model_backtesting",
        }
    }

    /// Parse from the stable wire string; unknown strings are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "agent_discovery" => Ok(JobType::AgentDiscovery),
            "judge_scoring" => Ok(JobType::JudgeScoring),
            "prompt_tuning" => Ok(JobType::PromptTuning),
            "model_backtesting" => Ok(JobType::ModelBacktesting),
            other => Err(Error::InvalidData(format!("unknown job type: {other}"))),
        }
    }

    /// Whether this type is scoped to a single prompt (slug required)
    /// rather than a whole project.
    #[must_use]
    pub fn is_per_prompt(&self) -> bool {
        !matches!(self, JobType::AgentDiscovery)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states.
///
/// The only permitted paths are
/// `pending -> running -> {completed, partially_completed, failed}` and
/// `pending -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the stable wire string; unknown statuses are rejected
    /// rather than passed through.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "partially_completed" => Ok(JobStatus::PartiallyCompleted),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidData(format!("unknown job status: {other}"))),
        }
    }

    /// Terminal states never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartiallyCompleted
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    /// Counts toward per-scope uniqueness and the pending/running cap.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether a transition from `self` to `next` is permitted.
    ///
    /// `running -> cancelled` covers the one case where a worker
    /// classifies its own outcome as cancelled (an identical tuning
    /// candidate); users can only cancel while still pending.
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::PartiallyCompleted)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semi-structured job payload stored in the `result` JSONB column.
///
/// Carries the input parameters the worker needs, the validation stats
/// captured at creation, and whatever output fields the worker records
/// on completion (kept in `extra`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Input parameters the dispatched task needs.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    /// Gate stats captured when the job was created, for observability.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub validation_stats: Map<String, Value>,

    /// Type-specific output fields, error strings, reasons.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobResult {
    /// A result carrying only input parameters.
    #[must_use]
    pub fn with_parameters(parameters: Map<String, Value>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    /// Look up a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Set an output field.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    /// Read an output field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// The central unit of orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub project_id: Uuid,
    /// Required for per-prompt types, `None` for project-wide ones.
    pub prompt_slug: Option<String>,
    pub status: JobStatus,
    /// Broker-side dispatch handle; set when the reconciler dispatches.
    pub task_id: Option<String>,
    /// `None` means system-triggered.
    pub triggered_by_user_id: Option<Uuid>,
    pub result: JobResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending job.
    #[must_use]
    pub fn new(job_type: JobType, project_id: Uuid, prompt_slug: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            project_id,
            prompt_slug,
            status: JobStatus::Pending,
            task_id: None,
            triggered_by_user_id: None,
            result: JobResult::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the triggering user (builder-style).
    #[must_use]
    pub fn triggered_by(mut self, user_id: Uuid) -> Self {
        self.triggered_by_user_id = Some(user_id);
        self
    }

    /// Attach the result payload (builder-style).
    #[must_use]
    pub fn with_result(mut self, result: JobResult) -> Self {
        self.result = result;
        self
    }

    /// Whether this job was created by the periodic scheduler.
    #[must_use]
    pub fn is_system_triggered(&self) -> bool {
        self.triggered_by_user_id.is_none()
    }

    /// True when `other` occupies the same (type, scope).
    /// Scope is the slug for per-prompt types and the project for
    /// project-wide ones.
    #[must_use]
    pub fn same_scope(&self, other: &Job) -> bool {
        self.job_type == other.job_type
            && self.project_id == other.project_id
            && (!self.job_type.is_per_prompt() || self.prompt_slug == other.prompt_slug)
    }
}
