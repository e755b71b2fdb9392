//! Threshold ladders - pure functions mapping an observed progress
//! count to the next gating threshold.
//!
//! Two ladders exist: the improvement/backtest ladder (50, 100, 200,
//! 500, 1000, then every 1000) and the review ladder (same with 10
//! prepended). The rollback function walks one step back so a criteria
//! edit makes the next tuning attempt immediately eligible.

use crate::model::ImprovementMetadata;

/// Initial rungs of the improvement/backtest ladder.
pub const IMPROVEMENT_THRESHOLDS: [i64; 5] = [50, 100, 200, 500, 1000];

/// Initial rungs of the review ladder.
pub const REVIEW_THRESHOLDS: [i64; 6] = [10, 50, 100, 200, 500, 1000];

/// Next improvement/backtest threshold after `current` scored spans.
/// Sequence: 50, 100, 200, 500, 1000, 2000, 3000, 4000...
#[must_use]
pub fn next_improvement_threshold(current: i64) -> i64 {
    next_from_ladder(&IMPROVEMENT_THRESHOLDS, current)
}

/// Next review threshold after `current` scored spans.
/// Sequence: 10, 50, 100, 200, 500, 1000, 2000, 3000, 4000...
#[must_use]
pub fn next_review_threshold(current: i64) -> i64 {
    next_from_ladder(&REVIEW_THRESHOLDS, current)
}

fn next_from_ladder(initial: &[i64], current: i64) -> i64 {
    for &threshold in initial {
        if current < threshold {
            return threshold;
        }
    }
    // After the initial rungs, increment by 1000.
    ((current / 1000) + 1) * 1000
}

/// The value `last_improvement_span_count` is reset to after scoring
/// logic changes.
///
/// Goes back one threshold step so that
/// `next_improvement_threshold(result) <= last`, meaning improvement
/// re-triggers as soon as the next scoring pass completes with the
/// updated criteria. Example: last ran at 120 spans (crossed threshold
/// 100) -> resets to 50, so the next threshold is 100 and 120 >= 100.
#[must_use]
pub fn previous_threshold_step(last: i64) -> i64 {
    if last <= 0 {
        return 0;
    }

    let mut ladder: Vec<i64> = vec![0];
    ladder.extend_from_slice(&IMPROVEMENT_THRESHOLDS);
    let mut t = IMPROVEMENT_THRESHOLDS[IMPROVEMENT_THRESHOLDS.len() - 1] + 1000;
    while t <= last {
        ladder.push(t);
        t += 1000;
    }

    let applicable: Vec<i64> = ladder.into_iter().filter(|&t| t <= last).collect();
    if applicable.len() < 2 {
        return 0;
    }
    applicable[applicable.len() - 2]
}

/// Roll back a prompt's improvement counter by one threshold step.
///
/// Called whenever evaluation criteria or the agent description change.
/// Idempotent within one improvement cycle: once `criteria_invalidated`
/// is set, repeated edits are no-ops until a tuning attempt runs and
/// clears the flag. A prompt that never improved (`last == 0`) is left
/// untouched.
///
/// Returns true when the metadata changed.
pub fn invalidate_improvement_metadata(metadata: &mut ImprovementMetadata) -> bool {
    if metadata.criteria_invalidated == Some(true) {
        return false;
    }

    let last = metadata.last_improvement_span_count;
    let rolled_back = previous_threshold_step(last);
    if rolled_back == last {
        return false;
    }

    metadata.criteria_invalidated = Some(true);
    metadata.last_improvement_span_count = rolled_back;
    true
}
