//! The server endpoint.
//!
//! One [`ServerNode`] runs per server rank. Its receive loop handles data
//! requests through the installed [`Updater`], executes control jobs from
//! the tracker through a learner-supplied executor, and exits on `Stop`.
//!
//! In sync mode the endpoint enforces the bounded-staleness contract with
//! two vector clocks: pushes from workers that have pulled too far ahead
//! and pulls from workers that have pushed too far ahead are parked in FIFO
//! buffers; every global-clock advance drains the opposite buffer, which
//! linearizes one logical iteration of all workers before the next begins.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use widefm_core::node::{self, NodeId};
use widefm_core::{KwArgs, Progress};

use crate::bus::{Bus, Envelope, KvRequest, KvResponse, Payload};
use crate::updater::Updater;
use crate::vector_clock::VectorClock;
use crate::ValueKind;

/// Consistency configuration of a server endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// False for fully asynchronous, true for bounded staleness.
    pub sync_mode: bool,
    /// Allowed lead over the global clock in sync mode.
    pub max_delay: i64,
    /// Send one progress report per this many updates.
    pub report_every: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sync_mode: false,
            max_delay: 0,
            report_every: 50,
        }
    }
}

impl ServerConfig {
    /// Consumes `sync_mode` and `max_delay` from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        Ok(Self {
            sync_mode: kwargs.take_or("sync_mode", false)?,
            max_delay: kwargs.take_or("max_delay", 0i64)?,
            report_every: 50,
        })
    }
}

/// Executes a control job body, returning serialized results.
pub type JobExecutor = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// One parameter-server shard.
pub struct ServerNode {
    id: NodeId,
    bus: Arc<Bus>,
    updater: Arc<dyn Updater>,
    config: ServerConfig,
    push_clock: VectorClock,
    pull_clock: VectorClock,
    waited_push: Vec<usize>,
    push_buf: VecDeque<(NodeId, KvRequest)>,
    pull_buf: VecDeque<(NodeId, KvRequest)>,
    seen_push: HashSet<(NodeId, i32)>,
    update_ct: usize,
}

impl ServerNode {
    /// Spawns the endpoint thread for server `rank`.
    pub fn spawn(
        bus: Arc<Bus>,
        rank: usize,
        updater: Arc<dyn Updater>,
        config: ServerConfig,
        mut executor: JobExecutor,
    ) -> JoinHandle<()> {
        let id = node::encode(node::SERVER_GROUP, rank as i32);
        let rx = bus.register(id);
        let num_workers = bus.num_workers();
        std::thread::Builder::new()
            .name(format!("widefm-server-{}", rank))
            .spawn(move || {
                let mut server = ServerNode {
                    id,
                    bus,
                    updater,
                    config,
                    push_clock: VectorClock::new(num_workers),
                    pull_clock: VectorClock::new(num_workers),
                    waited_push: vec![0; num_workers],
                    push_buf: VecDeque::new(),
                    pull_buf: VecDeque::new(),
                    seen_push: HashSet::new(),
                    update_ct: 0,
                };
                info!(rank, sync = server.config.sync_mode, "server started");
                loop {
                    let env = match rx.recv_timeout(std::time::Duration::from_secs(2)) {
                        Ok(env) => env,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if server.bus.is_dead(node::SCHEDULER) {
                                error!(rank, "scheduler died, stopping server");
                                break;
                            }
                            continue;
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    };
                    let Envelope { from, payload, .. } = env;
                    match payload {
                        Payload::KvReq(req) => server.handle_kv(from, req),
                        Payload::Job { dispatch, body } => {
                            let rets = executor(&body);
                            let _ = server.bus.send(
                                server.id,
                                from,
                                Payload::JobDone { dispatch, rets },
                            );
                        }
                        Payload::Stop => break,
                        _ => {}
                    }
                }
                info!(rank, "server stopped");
            })
            .expect("spawn server thread")
    }

    fn handle_kv(&mut self, from: NodeId, req: KvRequest) {
        let rank = node::rank_of(from) as usize;
        if req.push {
            if self.config.sync_mode {
                if self.pull_clock.local(rank) > self.pull_clock.global() + self.config.max_delay
                {
                    debug!(worker = rank, ts = req.ts, "buffering early push");
                    self.push_buf.push_back((from, req));
                    self.waited_push[rank] += 1;
                    return;
                }
                self.apply_push(from, req);
                if self.push_clock.update(rank) {
                    self.drain_pulls();
                }
            } else {
                self.apply_push(from, req);
            }
        } else if self.config.sync_mode {
            if self.push_clock.local(rank) > self.push_clock.global() + self.config.max_delay
                || self.waited_push[rank] > 0
            {
                debug!(worker = rank, ts = req.ts, "buffering early pull");
                self.pull_buf.push_back((from, req));
                return;
            }
            self.answer_pull(from, req);
            if self.pull_clock.update(rank) {
                self.drain_pushes();
            }
        } else {
            self.answer_pull(from, req);
        }
    }

    fn drain_pulls(&mut self) {
        while let Some((from, req)) = self.pull_buf.pop_front() {
            let rank = node::rank_of(from) as usize;
            self.answer_pull(from, req);
            self.pull_clock.update(rank);
        }
    }

    fn drain_pushes(&mut self) {
        while let Some((from, req)) = self.push_buf.pop_front() {
            let rank = node::rank_of(from) as usize;
            self.apply_push(from, req);
            self.push_clock.update(rank);
            self.waited_push[rank] -= 1;
        }
    }

    fn apply_push(&mut self, from: NodeId, req: KvRequest) {
        if self.seen_push.insert((from, req.ts)) {
            if let Err(e) = self
                .updater
                .update(&req.keys, req.kind, &req.vals, &req.lens)
            {
                // Precondition faults are programmer bugs.
                error!(from, ts = req.ts, "fatal push error: {}", e);
                panic!("fatal push error: {}", e);
            }
            if req.kind != ValueKind::Weight {
                self.update_ct += 1;
                if self.update_ct > self.config.report_every {
                    self.report();
                    self.update_ct = 0;
                }
            }
        } else {
            debug!(from, ts = req.ts, "duplicate push re-acknowledged");
        }
        let res = KvResponse {
            ts: req.ts,
            push: true,
            kind: req.kind,
            keys: Default::default(),
            vals: Default::default(),
            lens: Default::default(),
        };
        let _ = self.bus.send(self.id, from, Payload::KvRes(res));
    }

    fn answer_pull(&mut self, from: NodeId, req: KvRequest) {
        let (vals, lens) = match self.updater.get(&req.keys, req.kind) {
            Ok(out) => out,
            Err(e) => {
                error!(from, ts = req.ts, "fatal pull error: {}", e);
                panic!("fatal pull error: {}", e);
            }
        };
        let res = KvResponse {
            ts: req.ts,
            push: false,
            kind: req.kind,
            keys: req.keys,
            vals,
            lens,
        };
        let _ = self.bus.send(self.id, from, Payload::KvRes(res));
    }

    /// Best-effort progress report to the scheduler.
    fn report(&self) {
        let prog: Progress = self.updater.report();
        if let Ok(bytes) = bincode::serialize(&prog) {
            let _ = self
                .bus
                .send(self.id, node::SCHEDULER, Payload::Report(bytes));
        }
    }
}
