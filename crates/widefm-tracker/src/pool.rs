//! The thread-safe workload pool.
//!
//! Parts move available -> assigned -> done. Assignment optionally picks a
//! random available part; one part is held per node at a time. A straggler
//! scan runs every 2 seconds: once ten job durations are known, any job
//! running longer than `max(10·mean, straggler_timeout)` goes back to
//! available (with a nonzero timeout alone the rule applies from the first
//! job). Duplicate completions of a reassigned part are accepted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

use widefm_core::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PartState {
    Available,
    Assigned,
}

#[derive(Debug)]
struct Assigned {
    node: NodeId,
    part: usize,
    start: Instant,
}

#[derive(Default)]
struct PoolInner {
    track: BTreeMap<usize, PartState>,
    assigned: Vec<Assigned>,
    durations: Vec<f64>,
}

impl Default for PartState {
    fn default() -> Self {
        PartState::Available
    }
}

/// Tracks which workload parts are available, in flight, or done.
pub struct WorkloadPool {
    inner: Mutex<PoolInner>,
    shuffle: bool,
    straggler_timeout: Duration,
    done: AtomicBool,
}

impl WorkloadPool {
    /// Creates a pool and starts its straggler scan thread.
    pub fn new(shuffle: bool, straggler_timeout: Duration) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            shuffle,
            straggler_timeout,
            done: AtomicBool::new(false),
        });
        let scan = Arc::clone(&pool);
        std::thread::Builder::new()
            .name("widefm-straggler".into())
            .spawn(move || {
                while !scan.done.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(2));
                    scan.remove_stragglers();
                }
            })
            .expect("spawn straggler thread");
        pool
    }

    /// Registers `num_parts` fresh parts.
    pub fn add(&self, num_parts: usize) {
        let mut inner = self.inner.lock();
        for i in 0..num_parts {
            inner.track.insert(i, PartState::Available);
        }
    }

    /// Drops all state, finished or not.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.track.clear();
        inner.assigned.clear();
        inner.durations.clear();
    }

    /// Picks an available part for `node`, one in flight per node.
    pub fn get(&self, node: NodeId) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.assigned.iter().any(|a| a.node == node) {
            return None;
        }
        let available: Vec<usize> = inner
            .track
            .iter()
            .filter(|(_, &s)| s == PartState::Available)
            .map(|(&k, _)| k)
            .collect();
        if available.is_empty() {
            return None;
        }
        let pick = if self.shuffle {
            available[rand::thread_rng().gen_range(0..available.len())]
        } else {
            available[0]
        };
        inner.track.insert(pick, PartState::Assigned);
        inner.assigned.push(Assigned {
            node,
            part: pick,
            start: Instant::now(),
        });
        info!(
            node,
            part = pick,
            in_flight = inner.assigned.len(),
            "assigned workload part"
        );
        Some(pick)
    }

    /// Retires whatever `node` was working on.
    ///
    /// A node whose part was reassigned has no assignment record left;
    /// its late completion is a no-op.
    pub fn finish(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        let mut i = 0;
        while i < inner.assigned.len() {
            if inner.assigned[i].node == node {
                let a = inner.assigned.swap_remove(i);
                let secs = a.start.elapsed().as_secs_f64();
                inner.durations.push(secs);
                inner.track.remove(&a.part);
                info!(node, part = a.part, "finished part in {:.2}s", secs);
            } else {
                i += 1;
            }
        }
    }

    /// Returns a dead node's parts to the available state.
    pub fn reset_node(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        let mut i = 0;
        while i < inner.assigned.len() {
            if inner.assigned[i].node == node {
                let a = inner.assigned.swap_remove(i);
                inner.track.insert(a.part, PartState::Available);
                info!(node, part = a.part, "node failed, part returned to pool");
            } else {
                i += 1;
            }
        }
    }

    /// Number of unfinished parts (available plus in flight).
    pub fn num_remains(&self) -> usize {
        self.inner.lock().track.len()
    }

    fn remove_stragglers(&self) {
        let mut inner = self.inner.lock();
        let threshold = if inner.durations.len() >= 10 {
            let mean = inner.durations.iter().sum::<f64>() / inner.durations.len() as f64;
            Duration::from_secs_f64(mean * 10.0).max(self.straggler_timeout)
        } else if !self.straggler_timeout.is_zero() {
            self.straggler_timeout
        } else {
            return;
        };
        let mut i = 0;
        while i < inner.assigned.len() {
            let age = inner.assigned[i].start.elapsed();
            if age > threshold {
                let a = inner.assigned.swap_remove(i);
                inner.track.insert(a.part, PartState::Available);
                info!(
                    node = a.node,
                    part = a.part,
                    "job ran {:.1}s, over the straggler threshold {:.1}s, reassigning",
                    age.as_secs_f64(),
                    threshold.as_secs_f64()
                );
            } else {
                i += 1;
            }
        }
    }
}

impl Drop for WorkloadPool {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<WorkloadPool> {
        WorkloadPool::new(false, Duration::ZERO)
    }

    #[test]
    fn test_assign_finish_cycle() {
        let p = pool();
        p.add(2);
        assert_eq!(p.num_remains(), 2);
        assert_eq!(p.get(12), Some(0));
        // One part per node at a time.
        assert_eq!(p.get(12), None);
        assert_eq!(p.get(20), Some(1));
        p.finish(12);
        assert_eq!(p.num_remains(), 1);
        assert_eq!(p.get(12), None); // nothing available
        p.finish(20);
        assert_eq!(p.num_remains(), 0);
    }

    #[test]
    fn test_duplicate_finish_is_idempotent() {
        let p = pool();
        p.add(1);
        p.get(12);
        p.finish(12);
        p.finish(12);
        assert_eq!(p.num_remains(), 0);
    }

    #[test]
    fn test_reset_returns_part() {
        let p = pool();
        p.add(1);
        assert_eq!(p.get(12), Some(0));
        p.reset_node(12);
        assert_eq!(p.num_remains(), 1);
        assert_eq!(p.get(20), Some(0));
    }

    #[test]
    fn test_straggler_reassigned_by_timeout() {
        let p = WorkloadPool::new(false, Duration::from_millis(5));
        p.add(1);
        assert_eq!(p.get(12), Some(0));
        std::thread::sleep(Duration::from_millis(10));
        p.remove_stragglers();
        // The part is available again for another node.
        assert_eq!(p.get(20), Some(0));
        // The original node's late completion is accepted quietly.
        p.finish(12);
        assert_eq!(p.num_remains(), 1);
        p.finish(20);
        assert_eq!(p.num_remains(), 0);
    }

    #[test]
    fn test_no_reassignment_without_signal() {
        let p = pool(); // zero timeout, fewer than 10 samples
        p.add(1);
        p.get(12);
        std::thread::sleep(Duration::from_millis(5));
        p.remove_stragglers();
        assert_eq!(p.get(20), None);
    }

    #[test]
    fn test_shuffled_pick_is_valid() {
        let p = WorkloadPool::new(true, Duration::ZERO);
        p.add(8);
        let k = p.get(12).unwrap();
        assert!(k < 8);
    }
}
