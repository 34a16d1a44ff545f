//! The worker-side store client.
//!
//! A [`StoreClient`] splits each push/pull by the server key ranges,
//! dispatches the per-server sub-requests, and reassembles pull responses
//! in server order (which, with sorted keys and contiguous ranges, is key
//! order). Operations return a timestamp immediately; completion callbacks
//! run on a small task pool so the response pump never blocks, and
//! [`StoreClient::wait`] parks the caller until an operation is fully
//! acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use widefm_core::node::{self, NodeId};
use widefm_core::{FeaId, Progress, SArray};

use crate::bus::{Bus, Envelope, KvRequest, KvResponse, Payload};
use crate::pool::TaskPool;
use crate::ValueKind;

/// The reassembled result of a pull.
#[derive(Debug, Clone, Default)]
pub struct PullValue {
    /// Concatenated values, aligned with the pulled keys.
    pub vals: SArray<f32>,
    /// Per-key value lengths; empty when the kind is fixed-length.
    pub lens: SArray<i32>,
}

type PushCallback = Box<dyn FnOnce() + Send>;
type PullCallback = Box<dyn FnOnce(PullValue) + Send>;

enum Completion {
    Push(Option<PushCallback>),
    Pull(Option<PullCallback>),
}

struct Pending {
    remaining: usize,
    /// Per-sub-request slots in ascending server-rank order.
    parts: Vec<(usize, Option<(SArray<f32>, SArray<i32>)>)>,
    completion: Completion,
}

struct ClientState {
    pending: HashMap<i32, Pending>,
    done: HashSet<i32>,
}

/// Worker-side push/pull endpoint of the parameter store.
pub struct StoreClient {
    bus: Arc<Bus>,
    id: NodeId,
    rank: usize,
    /// Inclusive key range per server rank.
    ranges: Vec<(FeaId, FeaId)>,
    next_ts: AtomicI32,
    state: Mutex<ClientState>,
    done_cv: Condvar,
    pool: TaskPool,
}

/// Splits the key space into `n` contiguous inclusive ranges.
fn server_ranges(n: usize) -> Vec<(FeaId, FeaId)> {
    let n = n.max(1) as u128;
    let span = (u64::MAX as u128 + 1) / n;
    (0..n)
        .map(|i| {
            let begin = (i * span) as FeaId;
            let end = if i + 1 == n {
                u64::MAX
            } else {
                ((i + 1) * span - 1) as FeaId
            };
            (begin, end)
        })
        .collect()
}

impl StoreClient {
    /// Registers worker `rank` on the bus and starts its response pump.
    ///
    /// Returns the client and the control receiver carrying every non-data
    /// message addressed to this worker (jobs, stop).
    pub fn new(bus: Arc<Bus>, rank: usize) -> (Arc<Self>, Receiver<Envelope>) {
        let id = node::encode(node::WORKER_GROUP, rank as i32);
        let rx = bus.register(id);
        let (ctrl_tx, ctrl_rx) = unbounded();
        let client = Arc::new(Self {
            ranges: server_ranges(bus.num_servers()),
            bus,
            id,
            rank,
            next_ts: AtomicI32::new(0),
            state: Mutex::new(ClientState {
                pending: HashMap::new(),
                done: HashSet::new(),
            }),
            done_cv: Condvar::new(),
            pool: TaskPool::new(2),
        });

        let weak: Weak<Self> = Arc::downgrade(&client);
        std::thread::Builder::new()
            .name(format!("widefm-worker-pump-{}", rank))
            .spawn(move || {
                for env in rx.iter() {
                    match env.payload {
                        Payload::KvRes(res) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.handle_response(env.from, res);
                        }
                        Payload::Stop => {
                            let _ = ctrl_tx.send(env);
                            break;
                        }
                        _ => {
                            if ctrl_tx.send(env).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .expect("spawn worker pump");

        (client, ctrl_rx)
    }

    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// This worker's encoded node ID.
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// Number of server shards.
    pub fn num_servers(&self) -> usize {
        self.bus.num_servers()
    }

    /// Number of workers in the cluster.
    pub fn num_workers(&self) -> usize {
        self.bus.num_workers()
    }

    /// Pushes `(keys, values)` to the owning servers.
    ///
    /// `lens` gives per-key value lengths; empty means the uniform length
    /// `values.len() / keys.len()`. Keys must be non-decreasing.
    pub fn push(
        &self,
        keys: SArray<FeaId>,
        kind: ValueKind,
        vals: SArray<f32>,
        lens: SArray<i32>,
        on_complete: Option<PushCallback>,
    ) -> i32 {
        assert_keys_sorted(&keys);
        let ts = self.next_ts.fetch_add(1, Ordering::Relaxed);
        let splits = self.split(&keys);
        if splits.is_empty() {
            self.complete_now(ts, Completion::Push(on_complete));
            return ts;
        }

        // Per-key byte offsets into vals.
        let offsets: Option<Vec<usize>> = if lens.is_empty() {
            None
        } else {
            let mut acc = 0usize;
            let mut out = Vec::with_capacity(lens.len() + 1);
            out.push(0);
            for &l in lens.iter() {
                acc += l as usize;
                out.push(acc);
            }
            Some(out)
        };
        let val_len = if keys.is_empty() { 0 } else { vals.len() / keys.len() };

        {
            let mut state = self.state.lock();
            state.pending.insert(
                ts,
                Pending {
                    remaining: splits.len(),
                    parts: splits.iter().map(|&(srv, _, _)| (srv, None)).collect(),
                    completion: Completion::Push(on_complete),
                },
            );
        }
        for &(srv, lo, hi) in &splits {
            let (vlo, vhi) = match &offsets {
                Some(off) => (off[lo], off[hi]),
                None => (lo * val_len, hi * val_len),
            };
            let req = KvRequest {
                ts,
                push: true,
                kind,
                keys: keys.slice(lo, hi),
                vals: vals.slice(vlo, vhi),
                lens: if lens.is_empty() {
                    Default::default()
                } else {
                    lens.slice(lo, hi)
                },
            };
            self.send_to_server(srv, req);
        }
        ts
    }

    /// Pulls values for `keys`; `on_complete` receives the assembled result.
    pub fn pull(
        &self,
        keys: SArray<FeaId>,
        kind: ValueKind,
        on_complete: impl FnOnce(PullValue) + Send + 'static,
    ) -> i32 {
        assert_keys_sorted(&keys);
        let ts = self.next_ts.fetch_add(1, Ordering::Relaxed);
        let splits = self.split(&keys);
        if splits.is_empty() {
            self.complete_now(ts, Completion::Pull(Some(Box::new(on_complete))));
            return ts;
        }
        {
            let mut state = self.state.lock();
            state.pending.insert(
                ts,
                Pending {
                    remaining: splits.len(),
                    parts: splits.iter().map(|&(srv, _, _)| (srv, None)).collect(),
                    completion: Completion::Pull(Some(Box::new(on_complete))),
                },
            );
        }
        for &(srv, lo, hi) in &splits {
            let req = KvRequest {
                ts,
                push: false,
                kind,
                keys: keys.slice(lo, hi),
                vals: Default::default(),
                lens: Default::default(),
            };
            self.send_to_server(srv, req);
        }
        ts
    }

    /// Pulls and blocks until the result is available.
    pub fn pull_wait(&self, keys: SArray<FeaId>, kind: ValueKind) -> PullValue {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let ts = self.pull(keys, kind, move |v| {
            *out.lock() = Some(v);
        });
        self.wait(ts);
        let value = slot.lock().take();
        value.unwrap_or_default()
    }

    /// Blocks until the operation behind `ts` is fully acknowledged.
    pub fn wait(&self, ts: i32) {
        let mut state = self.state.lock();
        loop {
            if state.done.remove(&ts) {
                return;
            }
            if !state.pending.contains_key(&ts) {
                return;
            }
            self.done_cv.wait(&mut state);
        }
    }

    /// Best-effort progress report to the scheduler.
    pub fn report(&self, prog: &Progress) {
        if let Ok(bytes) = bincode::serialize(prog) {
            let _ = self
                .bus
                .send(self.id, node::SCHEDULER, Payload::Report(bytes));
        }
    }

    /// Folds one server response into its pending operation.
    pub fn handle_response(&self, from: NodeId, res: KvResponse) {
        let srv = node::rank_of(from) as usize;
        let finished = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.get_mut(&res.ts) else {
                return; // duplicate ack
            };
            if let Some(slot) = pending
                .parts
                .iter_mut()
                .find(|(rank, v)| *rank == srv && v.is_none())
            {
                slot.1 = Some((res.vals, res.lens));
                pending.remaining -= 1;
            }
            if pending.remaining > 0 {
                return;
            }
            let pending = state.pending.remove(&res.ts).unwrap();
            state.done.insert(res.ts);
            pending
        };
        self.done_cv.notify_all();
        self.dispatch(finished);
    }

    fn dispatch(&self, pending: Pending) {
        match pending.completion {
            Completion::Push(None) => {}
            Completion::Push(Some(cb)) => self.pool.spawn(cb),
            Completion::Pull(cb) => {
                let mut vals = Vec::new();
                let mut lens = Vec::new();
                for (_, part) in pending.parts {
                    if let Some((v, l)) = part {
                        vals.extend_from_slice(&v);
                        lens.extend_from_slice(&l);
                    }
                }
                let value = PullValue {
                    vals: vals.into(),
                    lens: lens.into(),
                };
                if let Some(cb) = cb {
                    self.pool.spawn(move || cb(value));
                }
            }
        }
    }

    fn complete_now(&self, ts: i32, completion: Completion) {
        self.state.lock().done.insert(ts);
        self.done_cv.notify_all();
        self.dispatch(Pending {
            remaining: 0,
            parts: Vec::new(),
            completion,
        });
    }

    /// Splits sorted keys into `(server, lo, hi)` sub-ranges.
    fn split(&self, keys: &SArray<FeaId>) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for (srv, &(begin, end)) in self.ranges.iter().enumerate() {
            let lo = keys.partition_point(|&k| k < begin);
            let hi = keys.partition_point(|&k| k <= end);
            if lo < hi {
                out.push((srv, lo, hi));
            }
        }
        out
    }

    fn send_to_server(&self, srv: usize, req: KvRequest) {
        let server_id = node::encode(node::SERVER_GROUP, srv as i32);
        if self
            .bus
            .send(self.id, server_id, Payload::KvReq(req))
            .is_err()
        {
            // Sharded state is not replicated; a lost server ends the run.
            error!(server = srv, "server unreachable, aborting training");
            panic!("server {} unreachable", srv);
        }
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        info!(rank = self.rank, "store client shut down");
    }
}

fn assert_keys_sorted(keys: &SArray<FeaId>) {
    assert!(
        keys.windows(2).all(|w| w[0] <= w[1]),
        "keys must be in non-decreasing order"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_ranges_cover_space() {
        for n in [1usize, 2, 3, 7] {
            let ranges = server_ranges(n);
            assert_eq!(ranges.len(), n);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges[n - 1].1, u64::MAX);
            for w in ranges.windows(2) {
                assert_eq!(w[0].1 + 1, w[1].0);
            }
        }
    }

    #[test]
    fn test_split_respects_ranges() {
        let bus = Arc::new(Bus::new(2, 1));
        let (client, _ctrl) = StoreClient::new(bus, 0);
        let half = 1u64 << 63;
        let keys: SArray<FeaId> = vec![1, 2, half - 1, half, u64::MAX].into();
        let splits = client.split(&keys);
        assert_eq!(splits, vec![(0, 0, 3), (1, 3, 5)]);
    }

    #[test]
    fn test_split_skips_empty_servers() {
        let bus = Arc::new(Bus::new(4, 1));
        let (client, _ctrl) = StoreClient::new(bus, 0);
        let keys: SArray<FeaId> = vec![1, 2, 3].into();
        let splits = client.split(&keys);
        assert_eq!(splits, vec![(0, 0, 3)]);
    }

    #[test]
    #[should_panic(expected = "non-decreasing")]
    fn test_unsorted_keys_are_a_precondition_fault() {
        let bus = Arc::new(Bus::new(1, 1));
        let (client, _ctrl) = StoreClient::new(bus, 0);
        client.push(
            vec![3u64, 1].into(),
            ValueKind::FeaCount,
            vec![1.0, 1.0].into(),
            Default::default(),
            None,
        );
    }

    #[test]
    fn test_empty_operation_completes_immediately() {
        let bus = Arc::new(Bus::new(1, 1));
        let (client, _ctrl) = StoreClient::new(bus, 0);
        let ts = client.push(
            Default::default(),
            ValueKind::FeaCount,
            Default::default(),
            Default::default(),
            None,
        );
        client.wait(ts); // must not hang
    }
}
