//! Cumulative timeout budget for a connection attempt

use std::time::{Duration, Instant};

/// Time left for a multi-stage attempt.
///
/// Every wait is charged with the time it actually took, so the sum of all
/// waits across all stages never exceeds the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    remaining: Option<Duration>,
}

impl TimeoutBudget {
    /// `None` never runs out
    pub fn new(limit: Option<Duration>) -> Self {
        Self { remaining: limit }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(Duration::ZERO)
    }

    /// Subtract the time spent in a wait, saturating at zero
    pub fn charge(&mut self, elapsed: Duration) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(elapsed);
        }
    }

    /// Length of the next wait.
    ///
    /// Blocking callers wait for everything that is left (`None` = no bound);
    /// non-blocking callers wait at most one poll interval.
    pub fn next_wait(&self, blocking: bool, poll_interval: Duration) -> Option<Duration> {
        match (blocking, self.remaining) {
            (true, remaining) => remaining,
            (false, Some(remaining)) => Some(remaining.min(poll_interval)),
            (false, None) => Some(poll_interval),
        }
    }

    /// Absolute point in time the budget runs out, if bounded
    pub fn deadline(&self) -> Option<Instant> {
        self.remaining.and_then(|remaining| Instant::now().checked_add(remaining))
    }

    /// Run `f` and charge its wall-clock time
    pub fn timed<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.charge(start.elapsed());
        result
    }
}

/// Point in time `timeout` from now.
///
/// `None`, or a timeout too large to represent, is unbounded.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Time left until `deadline`; `None` stays unbounded
pub(crate) fn until(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_charge_saturates() {
        let mut budget = TimeoutBudget::new(Some(Duration::from_millis(100)));
        budget.charge(Duration::from_millis(60));
        assert_eq!(budget.remaining(), Some(Duration::from_millis(40)));
        budget.charge(Duration::from_millis(60));
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let mut budget = TimeoutBudget::unbounded();
        budget.charge(Duration::from_secs(3600));
        assert!(!budget.is_exhausted());
        assert_eq!(budget.next_wait(true, Duration::from_millis(10)), None);
        assert!(budget.deadline().is_none());
    }

    #[test]
    fn test_next_wait_respects_mode() {
        let poll = Duration::from_millis(10);
        let budget = TimeoutBudget::new(Some(Duration::from_millis(4)));
        assert_eq!(budget.next_wait(false, poll), Some(Duration::from_millis(4)));
        assert_eq!(budget.next_wait(true, poll), Some(Duration::from_millis(4)));

        let budget = TimeoutBudget::new(Some(Duration::from_secs(1)));
        assert_eq!(budget.next_wait(false, poll), Some(poll));
        assert_eq!(budget.next_wait(true, poll), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_deadline_after_overflow_is_unbounded() {
        assert!(deadline_after(None).is_none());
        assert!(deadline_after(Some(Duration::MAX)).is_none());
        assert!(deadline_after(Some(Duration::from_millis(5))).is_some());
        assert!(TimeoutBudget::new(Some(Duration::MAX)).deadline().is_none());
    }

    #[test]
    fn test_timed_charges_elapsed() {
        let mut budget = TimeoutBudget::new(Some(Duration::from_secs(1)));
        budget.timed(|| std::thread::sleep(Duration::from_millis(20)));
        assert!(budget.remaining().unwrap() <= Duration::from_millis(980));
    }

    proptest! {
        #[test]
        fn prop_waits_never_exceed_remaining(
            total in 0u64..5_000,
            charges in proptest::collection::vec(0u64..2_000, 0..10),
            poll in 1u64..100,
            blocking in any::<bool>(),
        ) {
            let mut budget = TimeoutBudget::new(Some(Duration::from_millis(total)));
            let mut spent = 0u64;
            for ms in charges {
                budget.charge(Duration::from_millis(ms));
                spent += ms;
                let remaining = Duration::from_millis(total.saturating_sub(spent));
                prop_assert_eq!(budget.remaining(), Some(remaining));
                let wait = budget.next_wait(blocking, Duration::from_millis(poll));
                prop_assert!(wait.map_or(false, |w| w <= remaining));
            }
        }
    }
}
