//! Core error types shared across the TraceTune workspace.

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A persisted value failed validation (unknown status, malformed id, …).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Storage backend failure (connection, query, transaction).
    #[error("storage error: {0}")]
    Storage(String),

    /// A row the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was refused by an eligibility gate.
    #[error("not eligible: {0}")]
    NotEligible(String),

    /// A same-scope job is already pending or running.
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// LLM provider returned a rate-limit response.
    #[error("llm rate limited: {0}")]
    LlmRateLimited(String),

    /// Any other LLM provider failure.
    #[error("llm call failed: {0}")]
    Llm(String),

    /// Work-queue broker failure (dispatch or state lookup).
    #[error("broker error: {0}")]
    Broker(String),

    /// Lock service failure.
    #[error("lock error: {0}")]
    Lock(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration problem detected at boot.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the error represents an in-flight duplicate, which
    /// schedulers count as deduped rather than skipped.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateJob(_))
    }

    /// True for rate-limit errors, which get the long backoff treatment.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::LlmRateLimited(_))
    }
}
