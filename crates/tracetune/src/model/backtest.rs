//! BacktestRun - grouping record for one model-backtesting invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Backtest run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Running,
    Completed,
    Failed,
}

impl BacktestStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktestStatus::Running => "running",
            BacktestStatus::Completed => "completed",
            BacktestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(BacktestStatus::Running),
            "completed" => Ok(BacktestStatus::Completed),
            "failed" => Ok(BacktestStatus::Failed),
            other => Err(Error::InvalidData(format!(
                "unknown backtest status: {other}"
            ))),
        }
    }
}

/// Groups the synthetic spans and metrics of one backtesting invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub id: Uuid,
    /// Composite prompt id string of the tested prompt version.
    pub prompt_id: String,
    /// Candidate models exercised by this run.
    pub models: Vec<String>,
    pub status: BacktestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BacktestRun {
    /// Start a new run.
    #[must_use]
    pub fn new(prompt_id: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt_id: prompt_id.into(),
            models,
            status: BacktestStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
