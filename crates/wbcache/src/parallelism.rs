//! Adaptive control of writeback concurrency.
//!
//! A linear increase / multiplicative decrease model that traces a sawtooth
//! around the highest parallelism the remote stores sustain without timing
//! out, capped by the size of the writer pool.

use tracing::debug;

use crate::error::WritebackError;

/// Tracks in-flight writebacks against an adaptive ceiling.
#[derive(Debug)]
pub struct Parallelism {
    /// Writebacks currently being performed.
    in_flight: usize,
    /// No new writeback starts unless `in_flight` is below this.
    max: usize,
    /// Error-free completions at the ceiling since the last timeout or
    /// change of `max`. Reaching `max` of them raises the ceiling.
    successes: usize,
    /// Hard upper bound for `max`: the writer pool size.
    cap: usize,
}

impl Parallelism {
    /// Create a controller starting at `initial_max`, never exceeding `cap`.
    pub fn new(initial_max: usize, cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            in_flight: 0,
            max: initial_max.clamp(1, cap),
            successes: 0,
            cap,
        }
    }

    /// Whether another writeback may start.
    pub fn ok(&self) -> bool {
        self.in_flight < self.max
    }

    /// Record a writeback being handed to a writer. Callers check [`ok`]
    /// first.
    ///
    /// [`ok`]: Parallelism::ok
    pub fn add(&mut self) {
        self.in_flight += 1;
    }

    /// Record a successful completion.
    pub fn success(&mut self) {
        self.in_flight -= 1;

        // A completion below the ceiling says nothing about whether the
        // ceiling is attainable.
        if self.in_flight + 1 < self.max {
            return;
        }

        self.successes += 1;

        if self.max == self.cap {
            return;
        }

        // `max` completions at the ceiling with no intervening timeout:
        // the current ceiling is attainable, step it up.
        if self.successes >= self.max {
            self.successes = 0;
            self.max += 1;
            debug!(max = self.max, "raised writeback ceiling");
        }
    }

    /// Record a failed completion. Returns true if the failure was a
    /// timeout and has been accounted for by lowering the ceiling (or by an
    /// earlier timeout that already lowered it); false leaves the error to
    /// the caller.
    pub fn failure(&mut self, err: &WritebackError) -> bool {
        self.in_flight -= 1;

        if !err.is_timeout() {
            return false;
        }

        self.successes = 0;

        // Still at or above the ceiling: an earlier timeout already lowered
        // it, don't halve twice for one overload.
        if self.in_flight >= self.max {
            return true;
        }

        self.max = (self.max + 1) / 2;
        debug!(max = self.max, "lowered writeback ceiling");
        true
    }

    /// Writebacks currently with a writer.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// The current ceiling.
    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> WritebackError {
        WritebackError::Put("request timeout".to_string())
    }

    fn transport_err() -> WritebackError {
        WritebackError::Put("connection refused".to_string())
    }

    #[test]
    fn test_initial_ceiling_clamped() {
        assert_eq!(Parallelism::new(0, 20).max(), 1);
        assert_eq!(Parallelism::new(6, 20).max(), 6);
        assert_eq!(Parallelism::new(50, 20).max(), 20);
    }

    #[test]
    fn test_ok_tracks_ceiling() {
        let mut p = Parallelism::new(2, 20);
        assert!(p.ok());
        p.add();
        assert!(p.ok());
        p.add();
        assert!(!p.ok());
        p.success();
        assert!(p.ok());
    }

    #[test]
    fn test_halve_then_raise() {
        let mut p = Parallelism::new(6, 20);
        for _ in 0..6 {
            assert!(p.ok());
            p.add();
        }
        assert!(p.failure(&timeout_err()));
        assert_eq!(p.max(), 3);

        // Three completions at the new ceiling raise it by one.
        p.success();
        p.success();
        p.success();
        assert_eq!(p.max(), 4);
    }

    #[test]
    fn test_no_double_halving() {
        let mut p = Parallelism::new(6, 20);
        for _ in 0..6 {
            p.add();
        }
        assert!(p.failure(&timeout_err()));
        assert_eq!(p.max(), 3);

        // in_flight is still at or above the ceiling: these timeouts are
        // fallout from the same overload.
        assert!(p.failure(&timeout_err()));
        assert!(p.failure(&timeout_err()));
        assert_eq!(p.max(), 3);

        // Below the ceiling again: a fresh timeout halves once more.
        assert!(p.failure(&timeout_err()));
        assert_eq!(p.max(), 2);
    }

    #[test]
    fn test_non_timeout_failure_left_to_caller() {
        let mut p = Parallelism::new(4, 20);
        p.add();
        p.add();
        assert!(!p.failure(&transport_err()));
        assert_eq!(p.max(), 4);
        assert_eq!(p.in_flight(), 1);
    }

    #[test]
    fn test_under_loaded_success_is_no_evidence() {
        let mut p = Parallelism::new(4, 20);
        p.add();
        p.success();

        for _ in 0..4 {
            p.add();
        }
        for _ in 0..3 {
            p.success();
            p.add();
        }
        // Only the three loaded completions counted.
        assert_eq!(p.max(), 4);
        p.success();
        assert_eq!(p.max(), 5);
    }

    #[test]
    fn test_ceiling_capped_at_pool_size() {
        let mut p = Parallelism::new(2, 2);
        p.add();
        p.add();
        for _ in 0..10 {
            p.success();
            p.add();
        }
        assert_eq!(p.max(), 2);
    }

    #[test]
    fn test_timeout_resets_success_run() {
        let mut p = Parallelism::new(3, 20);
        for _ in 0..3 {
            p.add();
        }
        p.success();
        p.add();
        p.failure(&timeout_err());
        assert_eq!(p.max(), 2);

        // The run restarts from zero after the timeout.
        p.success();
        p.add();
        p.success();
        assert_eq!(p.max(), 3);
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Success,
        Timeout,
        Transport,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Success), Just(Op::Timeout), Just(Op::Transport)]
    }

    proptest! {
        #[test]
        fn test_ceiling_bounds_hold(
            initial in 0usize..64,
            cap in 1usize..32,
            ops in proptest::collection::vec(op_strategy(), 0..200),
        ) {
            let mut p = Parallelism::new(initial, cap);
            for op in ops {
                while p.ok() {
                    p.add();
                }
                match op {
                    Op::Success => p.success(),
                    Op::Timeout => {
                        p.failure(&WritebackError::Put("timeout".to_string()));
                    }
                    Op::Transport => {
                        p.failure(&WritebackError::Put("refused".to_string()));
                    }
                }
                prop_assert!(p.max() >= 1);
                prop_assert!(p.max() <= cap);
                prop_assert!(!p.ok() || p.in_flight() < p.max());
            }
        }
    }
}
