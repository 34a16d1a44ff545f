//! A small fixed-size task pool.
//!
//! Pull and push completion callbacks run here so the transport receive
//! loop never blocks on application work. The queue is unbounded; the
//! bounded element of the training pipeline is the learner's in-flight
//! batch limit, not this pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send>;

struct PoolState {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

struct PoolQueue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

/// A fixed set of threads draining a task queue.
pub struct TaskPool {
    state: Arc<PoolState>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `n` worker threads (at least one).
    pub fn new(n: usize) -> Self {
        let state = Arc::new(PoolState {
            queue: Mutex::new(PoolQueue {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let workers = (0..n.max(1))
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("widefm-pool-{}", i))
                    .spawn(move || loop {
                        let task = {
                            let mut q = state.queue.lock();
                            loop {
                                if let Some(task) = q.tasks.pop_front() {
                                    break task;
                                }
                                if q.shutdown {
                                    return;
                                }
                                state.available.wait(&mut q);
                            }
                        };
                        task();
                    })
                    .expect("spawn pool thread")
            })
            .collect();
        Self { state, workers }
    }

    /// Enqueues a task.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        let mut q = self.state.queue.lock();
        if q.shutdown {
            return;
        }
        q.tasks.push_back(Box::new(task));
        drop(q);
        self.state.available.notify_one();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.state.queue.lock().shutdown = true;
        self.state.available.notify_all();
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_tasks() {
        let pool = TaskPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // drains remaining tasks before joining
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
