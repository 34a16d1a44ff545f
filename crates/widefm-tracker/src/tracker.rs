//! The scheduler-side tracker.
//!
//! The tracker owns the scheduler's inbox. Its receive thread folds job
//! completions back into the workload pool or into a waiting
//! `issue_and_wait` call and forwards progress reports to the monitor; a
//! dispatch thread keeps one part in flight per live worker; a liveness
//! thread returns dead workers' parts to the pool every 2 seconds.
//!
//! Stop is two-phase: drain the pool, then broadcast `Stop` to the server
//! and worker groups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use widefm_core::node::{self, NodeId};
use widefm_store::{Bus, Envelope, Payload};

use crate::job::{Job, JobType};
use crate::pool::WorkloadPool;

/// Callback for part results: `(node, serialized returns)`.
pub type Monitor = Box<dyn Fn(NodeId, &[u8]) + Send + Sync>;

/// Callback for progress reports: `(node, serialized progress)`.
pub type ReportMonitor = Box<dyn Fn(NodeId, &[u8]) + Send + Sync>;

struct IssueWait {
    remaining: usize,
    /// Elementwise sum of each member's returned vector.
    merged: Vec<f32>,
}

#[derive(Default)]
struct TrackerState {
    issues: HashMap<u64, IssueWait>,
    /// Parts currently dispatched, by dispatch id.
    parts: HashMap<u64, (NodeId, usize)>,
}

/// The scheduler's dispatcher.
pub struct Tracker {
    bus: Arc<Bus>,
    pool: Arc<WorkloadPool>,
    state: Mutex<TrackerState>,
    issue_cv: Condvar,
    monitor: Mutex<Option<Monitor>>,
    report_monitor: Mutex<Option<ReportMonitor>>,
    next_dispatch: AtomicU64,
    /// Template for pool dispatch; part/num filled per assignment.
    template: Mutex<Option<Job>>,
    num_parts: AtomicI32,
    stopped: AtomicBool,
}

impl Tracker {
    /// Registers the scheduler on the bus and starts the tracker threads.
    pub fn new(bus: Arc<Bus>, shuffle: bool, straggler_timeout: Duration) -> Arc<Self> {
        let rx = bus.register(node::SCHEDULER);
        let tracker = Arc::new(Self {
            pool: WorkloadPool::new(shuffle, straggler_timeout),
            bus,
            state: Mutex::new(TrackerState::default()),
            issue_cv: Condvar::new(),
            monitor: Mutex::new(None),
            report_monitor: Mutex::new(None),
            next_dispatch: AtomicU64::new(1),
            template: Mutex::new(None),
            num_parts: AtomicI32::new(0),
            stopped: AtomicBool::new(false),
        });

        // Receive thread: completions and reports.
        let recv = Arc::clone(&tracker);
        std::thread::Builder::new()
            .name("widefm-tracker-recv".into())
            .spawn(move || {
                for Envelope { from, payload, .. } in rx.iter() {
                    match payload {
                        Payload::JobDone { dispatch, rets } => recv.on_done(from, dispatch, &rets),
                        Payload::Report(bytes) => {
                            if let Some(cb) = recv.report_monitor.lock().as_ref() {
                                cb(from, &bytes);
                            }
                        }
                        Payload::Stop => break,
                        _ => {}
                    }
                }
            })
            .expect("spawn tracker recv thread");

        // Dispatch thread: keep one part in flight per live worker.
        let pump = Arc::clone(&tracker);
        std::thread::Builder::new()
            .name("widefm-tracker-dispatch".into())
            .spawn(move || {
                while !pump.stopped.load(Ordering::Relaxed) {
                    pump.pump_dispatch();
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
            .expect("spawn tracker dispatch thread");

        // Liveness thread: dead workers lose their parts.
        let live = Arc::clone(&tracker);
        std::thread::Builder::new()
            .name("widefm-tracker-monitor".into())
            .spawn(move || {
                while !live.stopped.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(2));
                    for dead in live.bus.dead_nodes() {
                        live.pool.reset_node(dead);
                    }
                }
            })
            .expect("spawn tracker monitor thread");

        tracker
    }

    /// Installs the per-part result callback.
    pub fn set_monitor(&self, cb: impl Fn(NodeId, &[u8]) + Send + Sync + 'static) {
        *self.monitor.lock() = Some(Box::new(cb));
    }

    /// Installs the progress-report callback.
    pub fn set_report_monitor(&self, cb: impl Fn(NodeId, &[u8]) + Send + Sync + 'static) {
        *self.report_monitor.lock() = Some(Box::new(cb));
    }

    /// Splits an epoch into `num_parts` jobs and starts dispatching them.
    pub fn start_dispatch(&self, num_parts: usize, job_type: JobType, epoch: i32) {
        self.pool.clear();
        self.pool.add(num_parts);
        self.num_parts.store(num_parts as i32, Ordering::Relaxed);
        *self.template.lock() = Some(Job::new(job_type, epoch));
        info!(num_parts, epoch, ?job_type, "dispatch started");
        self.pump_dispatch();
    }

    /// Unfinished parts of the current dispatch.
    pub fn num_remains(&self) -> usize {
        self.pool.num_remains()
    }

    /// Blocks until every dispatched part finished.
    pub fn wait_all(&self) {
        while self.pool.num_remains() > 0 {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Sends `job` to every member of `group` and merges their returns.
    ///
    /// Each member's serialized `Vec<f32>` is summed elementwise; report
    /// order across members is irrelevant.
    pub fn issue_and_wait(&self, group: NodeId, job: &Job) -> Vec<f32> {
        let members = self.bus.nodes_in_group(group);
        if members.is_empty() {
            return Vec::new();
        }
        let dispatch = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.issues.insert(
                dispatch,
                IssueWait {
                    remaining: members.len(),
                    merged: Vec::new(),
                },
            );
        }
        let body = job.to_bytes();
        for id in &members {
            if self
                .bus
                .send(node::SCHEDULER, *id, Payload::Job {
                    dispatch,
                    body: body.clone(),
                })
                .is_err()
            {
                warn!(node = *id, "issue to dead node");
                let mut state = self.state.lock();
                if let Some(wait) = state.issues.get_mut(&dispatch) {
                    wait.remaining -= 1;
                }
            }
        }
        let mut state = self.state.lock();
        loop {
            match state.issues.get(&dispatch) {
                Some(wait) if wait.remaining == 0 => {
                    let wait = state.issues.remove(&dispatch).unwrap();
                    return wait.merged;
                }
                Some(_) => self.issue_cv.wait(&mut state),
                None => return Vec::new(),
            }
        }
    }

    /// Drains remaining parts, then broadcasts stop to servers and workers.
    pub fn stop(&self) {
        self.wait_all();
        info!("dispatch drained, broadcasting stop");
        let _ = self.bus.send(
            node::SCHEDULER,
            node::SERVER_GROUP + node::WORKER_GROUP,
            Payload::Stop,
        );
        self.stopped.store(true, Ordering::Relaxed);
        // Unblock the scheduler's own receive loop.
        let _ = self.bus.send(node::SCHEDULER, node::SCHEDULER, Payload::Stop);
    }

    fn pump_dispatch(&self) {
        let template = {
            let t = self.template.lock();
            match &*t {
                Some(job) => job.clone(),
                None => return,
            }
        };
        let num_parts = self.num_parts.load(Ordering::Relaxed);
        for worker in self.bus.nodes_in_group(node::WORKER_GROUP) {
            let Some(part) = self.pool.get(worker) else {
                continue;
            };
            let dispatch = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
            let mut job = template.clone();
            job.part_idx = part as i32;
            job.num_parts = num_parts;
            self.state.lock().parts.insert(dispatch, (worker, part));
            if self
                .bus
                .send(node::SCHEDULER, worker, Payload::Job {
                    dispatch,
                    body: job.to_bytes(),
                })
                .is_err()
            {
                self.state.lock().parts.remove(&dispatch);
                self.pool.reset_node(worker);
            }
        }
    }

    fn on_done(&self, from: NodeId, dispatch: u64, rets: &[u8]) {
        let mut state = self.state.lock();
        if let Some(wait) = state.issues.get_mut(&dispatch) {
            if let Ok(vals) = bincode::deserialize::<Vec<f32>>(rets) {
                if wait.merged.len() < vals.len() {
                    wait.merged.resize(vals.len(), 0.0);
                }
                for (m, v) in wait.merged.iter_mut().zip(vals.iter()) {
                    *m += v;
                }
            }
            wait.remaining = wait.remaining.saturating_sub(1);
            drop(state);
            self.issue_cv.notify_all();
            return;
        }
        if state.parts.remove(&dispatch).is_some() {
            drop(state);
            self.pool.finish(from);
            if !rets.is_empty() {
                if let Some(cb) = self.monitor.lock().as_ref() {
                    cb(from, rets);
                }
            }
            // Hand the finisher its next part without waiting for the pump.
            self.pump_dispatch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widefm_store::Bus;

    /// A minimal worker loop answering every job with a fixed vector.
    fn spawn_worker(bus: &Arc<Bus>, rank: i32, rets: Vec<f32>) {
        let id = node::encode(node::WORKER_GROUP, rank);
        let rx = bus.register(id);
        let bus = Arc::clone(bus);
        std::thread::spawn(move || {
            for env in rx.iter() {
                match env.payload {
                    Payload::Job { dispatch, .. } => {
                        let body = bincode::serialize(&rets).unwrap();
                        let _ = bus.send(id, env.from, Payload::JobDone {
                            dispatch,
                            rets: body,
                        });
                    }
                    Payload::Stop => break,
                    _ => {}
                }
            }
        });
    }

    #[test]
    fn test_issue_and_wait_merges_returns() {
        let bus = Arc::new(Bus::new(0, 2));
        spawn_worker(&bus, 0, vec![1.0, 2.0]);
        spawn_worker(&bus, 1, vec![10.0, 20.0, 30.0]);
        let tracker = Tracker::new(Arc::clone(&bus), false, Duration::ZERO);
        let merged =
            tracker.issue_and_wait(node::WORKER_GROUP, &Job::new(JobType::Evaluate, 0));
        assert_eq!(merged, vec![11.0, 22.0, 30.0]);
        tracker.stop();
    }

    #[test]
    fn test_dispatch_runs_all_parts() {
        let bus = Arc::new(Bus::new(0, 2));
        spawn_worker(&bus, 0, vec![1.0]);
        spawn_worker(&bus, 1, vec![1.0]);
        let tracker = Tracker::new(Arc::clone(&bus), false, Duration::ZERO);
        let count = Arc::new(AtomicI32::new(0));
        let seen = Arc::clone(&count);
        tracker.set_monitor(move |_, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        tracker.start_dispatch(6, JobType::Train, 0);
        tracker.wait_all();
        assert_eq!(count.load(Ordering::Relaxed), 6);
        tracker.stop();
    }
}
