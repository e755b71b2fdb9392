//! Beat scheduler: fires registered task names on fixed cadences.
//!
//! Two cadence shapes cover the whole schedule: every-N-seconds ticks
//! and a daily-at-UTC slot for cleanup. Dispatch failures are logged
//! and swallowed - the next tick covers the gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::TaskBroker;

/// When a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval, first firing one interval after start.
    Every(Duration),
    /// Once a day at the given UTC wall-clock time.
    DailyAtUtc { hour: u32, minute: u32 },
}

/// One schedule row.
#[derive(Debug, Clone)]
pub struct BeatEntry {
    pub task: String,
    pub cadence: Cadence,
}

/// The beat scheduler. Owns one loop per entry.
pub struct Beat {
    broker: Arc<dyn TaskBroker>,
    entries: Vec<BeatEntry>,
}

impl Beat {
    #[must_use]
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self {
            broker,
            entries: Vec::new(),
        }
    }

    /// Add a schedule entry (builder-style).
    #[must_use]
    pub fn entry(mut self, task: impl Into<String>, cadence: Cadence) -> Self {
        self.entries.push(BeatEntry {
            task: task.into(),
            cadence,
        });
        self
    }

    /// The configured schedule.
    #[must_use]
    pub fn entries(&self) -> &[BeatEntry] {
        &self.entries
    }

    /// Spawn every schedule loop onto the runtime. The returned handles
    /// run until aborted.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let broker = Arc::clone(&self.broker);
            info!(task = %entry.task, cadence = ?entry.cadence, "scheduling beat entry");
            handles.push(tokio::spawn(run_entry(broker, entry)));
        }
        handles
    }
}

async fn run_entry(broker: Arc<dyn TaskBroker>, entry: BeatEntry) {
    loop {
        let sleep_for = match entry.cadence {
            Cadence::Every(period) => period,
            Cadence::DailyAtUtc { hour, minute } => until_next_utc(hour, minute),
        };
        tokio::time::sleep(sleep_for).await;

        if let Err(err) = broker.send_task(&entry.task, json!({})).await {
            warn!(task = %entry.task, error = %err, "beat dispatch failed");
        }
    }
}

/// Time until the next occurrence of `hour:minute` UTC.
fn until_next_utc(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let target_time =
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_else(|| NaiveTime::MIN);
    let mut next = now.date_naive().and_time(target_time).and_utc();
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::InProcessBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn next_daily_occurrence_is_within_a_day() {
        let wait = until_next_utc(0, 0);
        assert!(wait <= Duration::from_secs(24 * 60 * 60));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_entries_fire_repeatedly() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let broker = Arc::new(InProcessBroker::new());
        broker.register("beat.tick", |_ctx| async {
            FIRED.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        });

        let handles = Beat::new(broker)
            .entry("beat.tick", Cadence::Every(Duration::from_secs(20)))
            .spawn();

        // Advance paused time past three periods; yield so the spawned
        // loops and handlers get polled.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(21)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        assert!(FIRED.load(Ordering::SeqCst) >= 2);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn beat_keeps_running_past_dispatch_failures() {
        // No handler registered: every dispatch errors, the loop survives.
        let broker = Arc::new(InProcessBroker::new());
        let handles = Beat::new(broker)
            .entry("beat.unknown", Cadence::Every(Duration::from_millis(5)))
            .spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        for handle in &handles {
            assert!(!handle.is_finished());
        }
        for handle in handles {
            handle.abort();
        }
    }
}
