//! Straggler reassignment over the in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use widefm_core::node::{self, NodeId};
use widefm_store::{Bus, Payload};
use widefm_tracker::{Job, JobType, Tracker};

/// A worker that sleeps `slow_ms` on its first job, then answers fast.
fn spawn_worker(
    bus: &Arc<Bus>,
    rank: i32,
    slow_ms: u64,
    log: Arc<Mutex<Vec<(NodeId, i32)>>>,
) {
    let id = node::encode(node::WORKER_GROUP, rank);
    let rx = bus.register(id);
    let bus = Arc::clone(bus);
    std::thread::spawn(move || {
        let mut first = true;
        for env in rx.iter() {
            match env.payload {
                Payload::Job { dispatch, body } => {
                    if first && slow_ms > 0 {
                        std::thread::sleep(Duration::from_millis(slow_ms));
                    }
                    first = false;
                    let job = Job::from_bytes(&body).unwrap();
                    log.lock().push((id, job.part_idx));
                    let _ = bus.send(
                        id,
                        env.from,
                        Payload::JobDone {
                            dispatch,
                            rets: Vec::new(),
                        },
                    );
                }
                Payload::Stop => break,
                _ => {}
            }
        }
    });
}

#[test]
fn test_straggler_part_is_reassigned() {
    // Four parts, two workers; worker 1 stalls far past the straggler
    // timeout on its first part. The part must be handed to worker 0 and
    // the epoch must complete long before the stall ends, with the
    // duplicate completion accepted.
    let bus = Arc::new(Bus::new(0, 2));
    let log = Arc::new(Mutex::new(Vec::new()));
    spawn_worker(&bus, 0, 0, Arc::clone(&log));
    spawn_worker(&bus, 1, 30_000, Arc::clone(&log));

    let tracker = Tracker::new(Arc::clone(&bus), false, Duration::from_millis(3000));
    let completions = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&completions);
    tracker.set_monitor(move |_, _| {
        seen.fetch_add(1, Ordering::Relaxed);
    });

    let start = Instant::now();
    tracker.start_dispatch(4, JobType::Train, 0);
    tracker.wait_all();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(10),
        "epoch took {:?}, straggler part was not reassigned",
        elapsed
    );
    // Worker 0 processed every part, including the reassigned one.
    let done = log.lock();
    let w0 = node::encode(node::WORKER_GROUP, 0);
    let mut parts: Vec<i32> = done
        .iter()
        .filter(|&&(n, _)| n == w0)
        .map(|&(_, p)| p)
        .collect();
    parts.sort_unstable();
    assert_eq!(parts, vec![0, 1, 2, 3]);

    tracker.stop();
}

#[test]
fn test_dead_worker_parts_are_reset() {
    let bus = Arc::new(Bus::new(0, 2));
    let log = Arc::new(Mutex::new(Vec::new()));
    spawn_worker(&bus, 0, 0, Arc::clone(&log));
    // Worker 1 registers, then dies without answering anything.
    let w1 = node::encode(node::WORKER_GROUP, 1);
    let rx1 = bus.register(w1);

    let tracker = Tracker::new(Arc::clone(&bus), false, Duration::ZERO);
    tracker.start_dispatch(3, JobType::Train, 0);
    std::thread::sleep(Duration::from_millis(200));
    drop(rx1); // node death: inbox disconnected
    bus.mark_dead(w1);

    let start = Instant::now();
    tracker.wait_all();
    assert!(start.elapsed() < Duration::from_secs(10));
    tracker.stop();
}
