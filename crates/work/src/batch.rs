//! Adaptive batch sizing.
//!
//! Jobs that walk an unbounded id range pick a batch size per run. After each
//! run they feed back how many items they finished and how long it took, and
//! get the batch size for the next run. Undersized batches grow, oversized
//! batches shrink, batches that fit are kept.

use std::time::Duration;

/// Share of the budget (and of the expected batch) that counts as "on target".
const ON_TARGET: f64 = 0.9;

/// Upper bound for "negligible" leftover time.
const NEGLIGIBLE_REMAINING: Duration = Duration::from_secs(1);

/// Compute the next batch size.
///
/// - `expected`: batch size the run was started with
/// - `done`: items actually processed
/// - `elapsed`: wall time spent on them
/// - `max_run_time`: the run's budget
/// - `max_batch`: optional ceiling
///
/// The result is always at least 1 and never above `max_batch`.
pub fn calculate_optimal_batch(
    expected: usize,
    done: usize,
    elapsed: Duration,
    max_run_time: Duration,
    max_batch: Option<usize>,
) -> usize {
    let expected = expected.max(1);
    let clamp = |n: usize| match max_batch {
        Some(max) => n.clamp(1, max.max(1)),
        None => n.max(1),
    };

    // No throughput estimate possible yet.
    if elapsed.is_zero() || max_run_time.is_zero() {
        return clamp(max_batch.unwrap_or(expected));
    }

    let spent = elapsed.as_secs_f64() / max_run_time.as_secs_f64();
    let remaining = max_run_time.saturating_sub(elapsed);
    let negligible = NEGLIGIBLE_REMAINING.min(max_run_time / 10);

    if spent <= 1.0 && (remaining < negligible || spent >= ON_TARGET) {
        if done as f64 >= expected as f64 * ON_TARGET {
            return clamp(expected);
        }
        return clamp(done);
    }

    let projected = (done as f64 / spent).floor();
    let projected = if projected >= usize::MAX as f64 {
        usize::MAX
    } else if projected.is_finite() && projected > 0.0 {
        projected as usize
    } else {
        1
    };
    clamp(projected)
}
