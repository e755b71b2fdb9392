//! # TraceTune Engine
//!
//! The background orchestration engine: a periodic scheduler that
//! produces candidate work, a durable job state machine, a reconciler
//! that dispatches PENDING jobs against live workers, pure eligibility
//! gates, and the worker handlers that do the actual LLM-driven work
//! (template discovery, judge scoring, prompt tuning, model
//! backtesting).
//!
//! The control flow in one breath: beat ticks run sweeps, sweeps run
//! gates and insert PENDING jobs, the reconciler dispatches them to the
//! broker and flips them to RUNNING, workers execute and land each job
//! in a terminal state, and the reconciler reclaims anything a crashed
//! worker left behind.

pub mod cleanup;
pub mod gates;
pub mod jobs;
pub mod prompts;
pub mod reconciler;
pub mod recommend;
pub mod registry;
pub mod reviews;
pub mod scheduler;
pub mod suggestions;
pub mod tasks;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use registry::{default_beat, register_tasks, Engine};
