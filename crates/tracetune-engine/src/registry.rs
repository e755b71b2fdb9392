//! Binds task names to handlers and the beat schedule to cadences.
//!
//! This is the single place where the stable task-name strings meet
//! executable code; everything else addresses work by name.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use tracetune::llm::LlmGateway;
use tracetune::locks::{with_lock, LockOutcome, LockService};
use tracetune::template::TemplateExtractor;
use tracetune::{Error, Result, Store};
use tracetune_broker::{Beat, Cadence, InProcessBroker, TaskBroker, TaskContext};

use crate::cleanup::{cleanup_old_jobs, CLEANUP_AGE_HOURS};
use crate::reconciler::reconcile;
use crate::reviews::{check_review_triggers, mark_review_completed};
use crate::scheduler::{
    auto_evaluation_sweep, backtest_candidates_sweep, discover_agents_sweep,
    prompt_improvement_sweep,
};
use crate::tasks;
use crate::workers::{self, run_job};

// Single-flight lock names, one per periodic tick.
const LOCK_DISCOVERY: &str = "agent_discovery";
const LOCK_AUTO_EVALUATION: &str = "auto_evaluate_unscored_spans";
const LOCK_IMPROVEMENT: &str = "prompt_improvement";
const LOCK_BACKTESTING: &str = "backtesting_check";
const LOCK_REVIEWS: &str = "periodic_reviews";

/// Everything the handlers need, shared across tasks.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn LlmGateway>,
    pub locks: Arc<dyn LockService>,
    pub extractor: Arc<dyn TemplateExtractor>,
}

fn skipped() -> Value {
    json!({"status": "skipped"})
}

fn job_id_from(ctx: &TaskContext) -> Result<Uuid> {
    ctx.params
        .get("job_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Error::InvalidData("task params missing job_id".into()))
}

fn prompt_id_from(ctx: &TaskContext) -> Result<String> {
    ctx.params
        .get("prompt_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidData("task params missing prompt_id".into()))
}

fn upgrade(broker: &Weak<InProcessBroker>) -> Result<Arc<InProcessBroker>> {
    broker
        .upgrade()
        .ok_or_else(|| Error::Broker("broker is shutting down".into()))
}

/// Register every task on the broker.
pub fn register_tasks(broker: &Arc<InProcessBroker>, engine: Arc<Engine>) {
    let weak = Arc::downgrade(broker);

    // ── Periodic sweeps, each under its single-flight lock ──────────────

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::DISCOVER_AGENTS, move |_ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let outcome = with_lock(engine.locks.as_ref(), LOCK_DISCOVERY, || async {
                    discover_agents_sweep(engine.store.as_ref(), broker.as_ref()).await
                })
                .await?;
                Ok(match outcome {
                    LockOutcome::Ran(stats) => stats.to_value(),
                    LockOutcome::Skipped => skipped(),
                })
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::EVALUATE_UNSCORED_SPANS, move |_ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let outcome = with_lock(engine.locks.as_ref(), LOCK_AUTO_EVALUATION, || async {
                    auto_evaluation_sweep(engine.store.as_ref(), broker.as_ref()).await
                })
                .await?;
                Ok(match outcome {
                    LockOutcome::Ran(stats) => stats.to_value(),
                    LockOutcome::Skipped => skipped(),
                })
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::IMPROVE_PROMPT_TEMPLATES, move |_ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let outcome = with_lock(engine.locks.as_ref(), LOCK_IMPROVEMENT, || async {
                    prompt_improvement_sweep(engine.store.as_ref(), broker.as_ref()).await
                })
                .await?;
                Ok(match outcome {
                    LockOutcome::Ran(stats) => stats.to_value(),
                    LockOutcome::Skipped => skipped(),
                })
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::CHECK_BACKTESTING_CANDIDATES, move |_ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let outcome = with_lock(engine.locks.as_ref(), LOCK_BACKTESTING, || async {
                    backtest_candidates_sweep(engine.store.as_ref(), broker.as_ref()).await
                })
                .await?;
                Ok(match outcome {
                    LockOutcome::Ran(stats) => stats.to_value(),
                    LockOutcome::Skipped => skipped(),
                })
            }
        });
    }

    // ── Reconciler and cleanup ──────────────────────────────────────────

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::RECONCILE_PENDING_JOBS, move |_ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let outcome = reconcile(
                    engine.store.as_ref(),
                    broker.as_ref(),
                    engine.locks.as_ref(),
                )
                .await?;
                Ok(match outcome {
                    LockOutcome::Ran(stats) => stats.to_value(),
                    LockOutcome::Skipped => skipped(),
                })
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::CLEANUP_OLD_JOBS, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let hours = ctx
                    .params
                    .get("older_than_hours")
                    .and_then(Value::as_i64)
                    .unwrap_or(CLEANUP_AGE_HOURS);
                cleanup_old_jobs(engine.store.as_ref(), hours).await
            }
        });
    }

    // ── Periodic reviews ────────────────────────────────────────────────

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::CHECK_REVIEW_TRIGGERS, move |_ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let outcome = with_lock(engine.locks.as_ref(), LOCK_REVIEWS, || async {
                    check_review_triggers(engine.store.as_ref()).await
                })
                .await?;
                Ok(outcome.into_inner().unwrap_or_else(skipped))
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::MARK_REVIEW_COMPLETED, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let prompt_id = prompt_id_from(&ctx)?;
                let count = ctx
                    .params
                    .get("current_span_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                mark_review_completed(engine.store.as_ref(), &prompt_id, count).await
            }
        });
    }

    // ── Per-job workers ─────────────────────────────────────────────────

    {
        let engine = Arc::clone(&engine);
        let weak = weak.clone();
        broker.register(tasks::RUN_AGENT_DISCOVERY, move |ctx| {
            let engine = Arc::clone(&engine);
            let weak = weak.clone();
            async move {
                let broker = upgrade(&weak)?;
                let job_id = job_id_from(&ctx)?;
                run_job(engine.store.as_ref(), job_id, &ctx.task_id, |job| async {
                    workers::discovery::run(
                        engine.store.as_ref(),
                        broker.as_ref(),
                        engine.extractor.as_ref(),
                        engine.gateway.as_ref(),
                        job,
                    )
                    .await
                })
                .await
            }
        });
    }

    for task_name in [tasks::EVALUATE_PROMPT_SPANS, tasks::EVALUATE_SPANS] {
        let engine = Arc::clone(&engine);
        broker.register(task_name, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let job_id = job_id_from(&ctx)?;
                run_job(engine.store.as_ref(), job_id, &ctx.task_id, |job| async {
                    workers::judge::run(engine.store.as_ref(), engine.gateway.as_ref(), job).await
                })
                .await
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::IMPROVE_SINGLE_PROMPT, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let job_id = job_id_from(&ctx)?;
                run_job(engine.store.as_ref(), job_id, &ctx.task_id, |job| async {
                    workers::tuning::run(engine.store.as_ref(), engine.gateway.as_ref(), job).await
                })
                .await
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::RUN_MODEL_BACKTESTING, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let job_id = job_id_from(&ctx)?;
                run_job(engine.store.as_ref(), job_id, &ctx.task_id, |job| async {
                    workers::backtest::run(engine.store.as_ref(), engine.gateway.as_ref(), job)
                        .await
                })
                .await
            }
        });
    }

    // ── Downstream tasks enqueued by discovery ──────────────────────────

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::GENERATE_CRITERIA, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let prompt_id = prompt_id_from(&ctx)?;
                workers::describe::generate_criteria(
                    engine.store.as_ref(),
                    engine.gateway.as_ref(),
                    &prompt_id,
                )
                .await
            }
        });
    }

    {
        let engine = Arc::clone(&engine);
        broker.register(tasks::GENERATE_INITIAL_DESCRIPTION, move |ctx| {
            let engine = Arc::clone(&engine);
            async move {
                let prompt_id = prompt_id_from(&ctx)?;
                workers::describe::generate_initial_description(
                    engine.store.as_ref(),
                    engine.gateway.as_ref(),
                    &prompt_id,
                )
                .await
            }
        });
    }
}

/// The default beat schedule.
#[must_use]
pub fn default_beat(broker: Arc<dyn TaskBroker>) -> Beat {
    Beat::new(broker)
        .entry(tasks::DISCOVER_AGENTS, Cadence::Every(Duration::from_secs(20)))
        .entry(
            tasks::EVALUATE_UNSCORED_SPANS,
            Cadence::Every(Duration::from_secs(20)),
        )
        .entry(
            tasks::IMPROVE_PROMPT_TEMPLATES,
            Cadence::Every(Duration::from_secs(300)),
        )
        .entry(
            tasks::CHECK_BACKTESTING_CANDIDATES,
            Cadence::Every(Duration::from_secs(300)),
        )
        .entry(
            tasks::RECONCILE_PENDING_JOBS,
            Cadence::Every(Duration::from_secs(30)),
        )
        .entry(tasks::CLEANUP_OLD_JOBS, Cadence::DailyAtUtc { hour: 0, minute: 0 })
        .entry(
            tasks::CHECK_REVIEW_TRIGGERS,
            Cadence::Every(Duration::from_secs(20)),
        )
}
