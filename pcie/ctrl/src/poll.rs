// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Poll-with-deadline primitive shared by every bounded retry site.
//!
//! The hardware exposes a number of conditions that can only be observed
//! by polling (link-up, PME acknowledge, LTSSM settling, LTR handshake).
//! All of them go through [`poll_until`] so the timeout semantics are the
//! same everywhere: the predicate is always checked at least once, the
//! deadline bounds the total wall-clock time spent, and the sleep interval
//! never pushes the last check past the deadline by more than one
//! interval.

use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// The polled condition did not become true before the deadline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("condition did not become true within {deadline:?}")]
pub struct PollTimeout {
    /// The deadline that expired.
    pub deadline: Duration,
}

/// Polls `predicate` every `interval` until it returns true or `deadline`
/// has elapsed.
pub fn poll_until(
    mut predicate: impl FnMut() -> bool,
    interval: Duration,
    deadline: Duration,
) -> Result<(), PollTimeout> {
    let start = Instant::now();
    loop {
        if predicate() {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(PollTimeout { deadline });
        }
        std::thread::sleep(interval);
    }
}

/// Like [`poll_until`], but also returns how much of `deadline` was left
/// when the condition became true. Used by callers that spread one budget
/// across several polling rounds.
pub fn poll_until_budgeted(
    predicate: impl FnMut() -> bool,
    interval: Duration,
    budget: &mut Duration,
) -> Result<(), PollTimeout> {
    let start = Instant::now();
    let deadline = *budget;
    let result = poll_until(predicate, interval, deadline);
    *budget = budget.saturating_sub(start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[test]
    fn immediate_success_skips_sleeping() {
        let start = Instant::now();
        poll_until(|| true, Duration::from_secs(10), Duration::from_secs(10)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn predicate_checked_at_least_once_with_zero_deadline() {
        assert!(poll_until(|| true, Duration::from_millis(1), Duration::ZERO).is_ok());
        assert_eq!(
            poll_until(|| false, Duration::from_millis(1), Duration::ZERO),
            Err(PollTimeout {
                deadline: Duration::ZERO
            })
        );
    }

    #[test]
    fn eventually_true_condition_succeeds() {
        let count = AtomicU32::new(0);
        poll_until(
            || count.fetch_add(1, Ordering::Relaxed) >= 3,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .unwrap();
    }

    #[test]
    fn budget_is_decremented_across_rounds() {
        let mut budget = Duration::from_millis(50);
        let _ = poll_until_budgeted(|| false, Duration::from_millis(5), &mut budget);
        assert_eq!(budget, Duration::ZERO);

        let mut budget = Duration::from_secs(60);
        poll_until_budgeted(|| true, Duration::from_millis(5), &mut budget).unwrap();
        assert!(budget > Duration::from_secs(59));
    }
}
