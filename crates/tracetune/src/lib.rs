//! # TraceTune Core
//!
//! The shared foundation of the TraceTune orchestration engine: the
//! persisted data model, boot configuration, threshold ladders, the
//! template extractor seam, the storage trait the engine programs
//! against, and the provider-agnostic LLM gateway.
//!
//! TraceTune ingests OpenTelemetry traces of LLM calls, groups similar
//! calls into prompt templates, scores each call against per-template
//! criteria, and iteratively improves those templates and proposes
//! cheaper or faster model swaps. This crate holds everything the
//! background pipelines share; the moving parts live in
//! `tracetune-engine`, with postgres/redis/broker backends in their own
//! crates.
//!
//! ## Example
//!
//! ```
//! use tracetune::thresholds::next_improvement_threshold;
//! use tracetune::model::PromptId;
//! use uuid::Uuid;
//!
//! // The ladder that throttles prompt tuning.
//! assert_eq!(next_improvement_threshold(120), 200);
//!
//! // The composite span -> prompt foreign key.
//! let id = PromptId::new(Uuid::new_v4(), 2, "checkout");
//! let parsed = PromptId::parse(&id.to_string()).unwrap();
//! assert_eq!(parsed.version, 2);
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod locks;
pub mod model;
pub mod storage;
pub mod template;
pub mod thresholds;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Settings;
pub use error::{Error, Result};
pub use storage::Store;
