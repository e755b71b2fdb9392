//! Distributed single-flight locks.
//!
//! Best-effort mutual exclusion across worker processes: periodic ticks
//! and the reconciler run under a named lock so a slow invocation never
//! overlaps its successor. The backend lives in `tracetune-redis`; the
//! in-memory implementation (testing feature) backs the test suites.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;

/// Prefix applied to every lock key in the shared key-value store.
pub const LOCK_PREFIX: &str = "lock:";

/// Safety timeout: must exceed the longest legitimate task duration.
/// It exists only to recover from crashed holders.
pub const DEFAULT_SAFETY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Non-blocking distributed locks with TTL fencing.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock. Returns false when another holder has it.
    /// A failed acquire never needs a release.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock. Must not error when the lock is missing or
    /// expired - safety-TTL expiry can race the holder.
    async fn release(&self, name: &str) -> Result<()>;
}

/// Outcome of [`with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// Body ran while holding the lock.
    Ran(T),
    /// Another invocation holds the lock; body skipped.
    Skipped,
}

impl<T> LockOutcome<T> {
    /// The body result, if it ran.
    pub fn into_inner(self) -> Option<T> {
        match self {
            LockOutcome::Ran(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

/// Run `body` under a named lock with the default safety TTL.
///
/// The lock is released on every exit path, including when `body`
/// errors. Release failures are logged, never propagated - losing a
/// release only costs one safety-TTL window.
pub async fn with_lock<S, F, Fut, T>(
    locks: &S,
    name: &str,
    body: F,
) -> Result<LockOutcome<T>>
where
    S: LockService + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !locks.acquire(name, DEFAULT_SAFETY_TTL).await? {
        return Ok(LockOutcome::Skipped);
    }

    let result = body().await;

    if let Err(err) = locks.release(name).await {
        warn!(lock = %name, error = %err, "failed to release task lock");
    }

    result.map(LockOutcome::Ran)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLocks;

    #[tokio::test]
    async fn body_runs_when_lock_is_free() {
        let locks = MemoryLocks::new();
        let outcome = with_lock(&locks, "agent_discovery", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Ran(7));
        // Released afterwards: a second run goes through too.
        let outcome = with_lock(&locks, "agent_discovery", || async { Ok(8) })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Ran(8));
    }

    #[tokio::test]
    async fn held_lock_skips_the_body() {
        let locks = MemoryLocks::new();
        assert!(locks
            .acquire("agent_discovery", DEFAULT_SAFETY_TTL)
            .await
            .unwrap());

        let outcome = with_lock(&locks, "agent_discovery", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Skipped);
    }

    #[tokio::test]
    async fn lock_released_even_when_body_errors() {
        let locks = MemoryLocks::new();
        let result: Result<LockOutcome<()>> = with_lock(&locks, "tick", || async {
            Err(crate::Error::Storage("db down".into()))
        })
        .await;
        assert!(result.is_err());

        // The lock must be free again.
        assert!(locks.acquire("tick", DEFAULT_SAFETY_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_of_missing_lock_is_silent() {
        let locks = MemoryLocks::new();
        locks.release("never_acquired").await.unwrap();
    }
}
