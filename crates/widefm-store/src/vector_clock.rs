//! Per-worker vector clocks.
//!
//! A server keeps one clock per request direction. Each worker's local
//! clock counts that worker's completed operations; the global clock is the
//! floor of all local clocks and advances only when the slowest worker
//! catches up. The bounded-staleness rule compares a worker's local clock
//! against `global + max_delay`.

/// A vector clock over a fixed set of workers.
#[derive(Debug, Clone)]
pub struct VectorClock {
    local: Vec<i64>,
    global: i64,
}

impl VectorClock {
    /// Creates a clock for `n` workers, all at zero.
    pub fn new(n: usize) -> Self {
        Self {
            local: vec![0; n],
            global: 0,
        }
    }

    /// Ticks worker `i`'s local clock.
    ///
    /// Returns true when the global clock advanced and every worker is now
    /// exactly aligned with it, the moment buffered requests are drained.
    pub fn update(&mut self, i: usize) -> bool {
        self.local[i] += 1;
        let min = *self.local.iter().min().unwrap();
        if self.global < min {
            self.global += 1;
            let max = *self.local.iter().max().unwrap();
            if self.global == max {
                return true;
            }
        }
        false
    }

    /// Worker `i`'s local clock.
    pub fn local(&self, i: usize) -> i64 {
        self.local[i]
    }

    /// The global clock, `min` over local clocks (lagging by construction).
    pub fn global(&self) -> i64 {
        self.global
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "global {} local {:?}", self.global, self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_bounded_by_min() {
        let mut clock = VectorClock::new(3);
        // Arbitrary update sequence; the invariant holds throughout.
        for &i in &[0, 0, 1, 2, 1, 0, 2, 2, 1, 0] {
            clock.update(i);
            let min = (0..3).map(|j| clock.local(j)).min().unwrap();
            assert!(clock.global() <= min);
        }
    }

    #[test]
    fn test_global_non_decreasing() {
        let mut clock = VectorClock::new(2);
        let mut prev = clock.global();
        for &i in &[0, 1, 1, 0, 0, 1, 1, 1, 0] {
            clock.update(i);
            assert!(clock.global() >= prev);
            prev = clock.global();
        }
    }

    #[test]
    fn test_aligned_signal() {
        let mut clock = VectorClock::new(2);
        assert!(!clock.update(0)); // worker 1 behind
        assert!(clock.update(1)); // everyone at 1, global caught up
        assert!(!clock.update(1)); // worker 1 ahead again
        assert!(clock.update(0));
    }

    #[test]
    fn test_single_worker_always_aligned() {
        let mut clock = VectorClock::new(1);
        for _ in 0..5 {
            assert!(clock.update(0));
        }
        assert_eq!(clock.global(), 5);
    }
}
