//! Rate-limited logging (spec.md section 7: "Errors are rate-limited at
//! the log layer with an hourly budget.").
//!
//! A small per-category token bucket gates how often a given error
//! category may be logged at `warn!`/`error!` level, so a persistently
//! failing backend doesn't flood the log. This mirrors the intent of
//! `examples/original_source/core123/include/core123/log_channel.hpp`
//! (leveled, categorized diagnostic channels) using `tracing` instead of
//! a hand-rolled macro layer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks, per category key, how many log events have been emitted in
/// the current hourly window and suppresses the rest.
pub struct LogBudget {
    per_hour: u32,
    window: Duration,
    state: Mutex<HashMap<&'static str, (Instant, u32)>>,
}

impl LogBudget {
    /// Creates a budget allowing up to `per_hour` log events per
    /// category per rolling hour.
    pub fn new(per_hour: u32) -> Self {
        LogBudget { per_hour, window: Duration::from_secs(3600), state: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if a log event tagged `category` should actually
    /// be emitted right now, bumping the internal counter as a side
    /// effect.
    pub fn allow(&self, category: &'static str) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry(category).or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        if entry.1 < self.per_hour {
            entry.1 += 1;
            true
        } else {
            false
        }
    }
}

impl Default for LogBudget {
    fn default() -> Self {
        // The original logs each error class sparingly but not silently;
        // an hourly cap in the low hundreds keeps a log file readable
        // during a prolonged outage without losing the "first few"
        // occurrences that matter for debugging.
        LogBudget::new(200)
    }
}

/// Logs `msg` at `warn!` under `category`, subject to `budget`.
#[macro_export]
macro_rules! warn_budgeted {
    ($budget:expr, $category:literal, $($arg:tt)*) => {
        if $budget.allow($category) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_after_budget_exhausted() {
        let budget = LogBudget::new(2);
        assert!(budget.allow("x"));
        assert!(budget.allow("x"));
        assert!(!budget.allow("x"));
    }

    #[test]
    fn categories_are_independent() {
        let budget = LogBudget::new(1);
        assert!(budget.allow("a"));
        assert!(budget.allow("b"));
    }
}
