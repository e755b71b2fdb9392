//! Named-task broker with a pollable result backend.
//!
//! Every background task is addressed by a stable string name (see
//! `tracetune-engine`'s task registry), dispatched with JSON
//! parameters, and tracked through the six broker states the
//! reconciler maps onto job rows. The in-process implementation runs
//! handlers on the tokio runtime; swapping in an external broker only
//! requires implementing [`TaskBroker`], since all task names stay
//! string-addressable.

mod beat;

pub use beat::{Beat, BeatEntry, Cadence};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use tracetune::{Error, Result};

/// Broker-side task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskState {
    /// States that mean the worker may still produce a result.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Started | TaskState::Retry)
    }
}

/// State plus outcome payload for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub state: TaskState,
    /// Present once the task reaches SUCCESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present once the task reaches FAILURE or REVOKED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            error: None,
        }
    }
}

/// What a task handler receives.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub params: Value,
}

/// Boxed async task handler.
pub type TaskHandler =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// The work-queue contract the reconciler and scheduler depend on.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Dispatch a named task; returns the broker-side task id.
    async fn send_task(&self, name: &str, params: Value) -> Result<String>;

    /// Poll the result backend. Unknown ids report PENDING, mirroring
    /// result backends that only materialise rows on completion.
    async fn task_state(&self, task_id: &str) -> Result<TaskOutcome>;
}

/// In-process broker: a registry of named handlers executed on tokio.
///
/// Suits single-node deployments; the beat scheduler and reconciler
/// only ever see the [`TaskBroker`] trait.
#[derive(Default)]
pub struct InProcessBroker {
    handlers: DashMap<String, TaskHandler>,
    states: Arc<DashMap<String, TaskOutcome>>,
}

impl InProcessBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a task name. Later registrations under
    /// the same name replace earlier ones.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(name.to_string(), handler);
    }

    /// Registered task names, for boot-time logging.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Poll until the task leaves the live states or `timeout` passes.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outcome = self.task_state(task_id).await?;
            if !outcome.state.is_live() {
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(outcome);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Force a task into a given state. Test hook for exercising the
    /// reconciler's stale-RUNNING sweep without real workers.
    #[cfg(any(test, feature = "testing"))]
    pub fn override_state(&self, task_id: &str, outcome: TaskOutcome) {
        self.states.insert(task_id.to_string(), outcome);
    }
}

#[async_trait]
impl TaskBroker for InProcessBroker {
    async fn send_task(&self, name: &str, params: Value) -> Result<String> {
        let handler = self
            .handlers
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::Broker(format!("unknown task name: {name}")))?;

        let task_id = Uuid::new_v4().to_string();
        self.states
            .insert(task_id.clone(), TaskOutcome::pending());
        debug!(task = %name, task_id = %task_id, "dispatching task");

        let states = Arc::clone(&self.states);
        let ctx = TaskContext {
            task_id: task_id.clone(),
            params,
        };
        let name = name.to_string();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            states.insert(
                spawned_id.clone(),
                TaskOutcome {
                    state: TaskState::Started,
                    result: None,
                    error: None,
                },
            );
            match handler(ctx).await {
                Ok(result) => {
                    states.insert(
                        spawned_id,
                        TaskOutcome {
                            state: TaskState::Success,
                            result: Some(result),
                            error: None,
                        },
                    );
                }
                Err(err) => {
                    error!(task = %name, error = %err, "task failed");
                    states.insert(
                        spawned_id,
                        TaskOutcome {
                            state: TaskState::Failure,
                            result: None,
                            error: Some(err.to_string()),
                        },
                    );
                }
            }
        });

        Ok(task_id)
    }

    async fn task_state(&self, task_id: &str) -> Result<TaskOutcome> {
        Ok(self
            .states
            .get(task_id)
            .map(|e| e.value().clone())
            .unwrap_or_else(TaskOutcome::pending))
    }
}
