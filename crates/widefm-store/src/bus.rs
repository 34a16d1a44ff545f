//! The in-process message transport.
//!
//! Every node (the scheduler, each server, each worker) registers an
//! inbox on the [`Bus`] under its encoded node ID and runs a receive loop.
//! Senders address either a single node or a group mask, in which case the
//! envelope fans out to every registered node of the matching groups.
//!
//! The payload enum is the complete message surface the store and tracker
//! need from a transport; a wire RPC implementation would carry exactly
//! these messages. Job bodies and returns are opaque byte strings so the
//! transport layer does not depend on any learner's job schema.
//!
//! Node death is observed rather than signalled: when a node's receive loop
//! exits, sends to it fail and the bus records it as dead; tests can force
//! the same state with [`Bus::mark_dead`].

use std::collections::{HashMap, HashSet};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use widefm_core::node::{self, NodeId};
use widefm_core::{FeaId, SArray};

use crate::error::{Result, StoreError};
use crate::ValueKind;

/// A key-value request from a worker to one server.
#[derive(Debug, Clone)]
pub struct KvRequest {
    /// Worker-local timestamp of the originating operation.
    pub ts: i32,
    /// True for push, false for pull.
    pub push: bool,
    /// What the payload holds.
    pub kind: ValueKind,
    /// Non-decreasing feature IDs.
    pub keys: SArray<FeaId>,
    /// Values; empty for a pull.
    pub vals: SArray<f32>,
    /// Optional per-key value lengths; empty means a fixed length.
    pub lens: SArray<i32>,
}

/// A server's answer to a [`KvRequest`].
#[derive(Debug, Clone)]
pub struct KvResponse {
    /// Echoed request timestamp.
    pub ts: i32,
    /// Echoed push flag.
    pub push: bool,
    /// Echoed value kind.
    pub kind: ValueKind,
    /// Echoed keys (pulls only).
    pub keys: SArray<FeaId>,
    /// Produced values (pulls only).
    pub vals: SArray<f32>,
    /// Produced per-key lengths (pulls only).
    pub lens: SArray<i32>,
}

/// Everything the transport carries.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Worker -> server data request.
    KvReq(KvRequest),
    /// Server -> worker data response.
    KvRes(KvResponse),
    /// Tracker -> executor job dispatch; the body is learner-defined.
    Job {
        /// Tracker-side dispatch identifier.
        dispatch: u64,
        /// Serialized job.
        body: Vec<u8>,
    },
    /// Executor -> tracker completion with serialized returns.
    JobDone {
        /// Echoed dispatch identifier.
        dispatch: u64,
        /// Serialized returns; may be empty.
        rets: Vec<u8>,
    },
    /// Best-effort progress report to the scheduler.
    Report(Vec<u8>),
    /// Orderly shutdown of the receiving node.
    Stop,
}

/// One routed message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending node.
    pub from: NodeId,
    /// Addressed node or group mask.
    pub to: NodeId,
    /// The message.
    pub payload: Payload,
}

struct BusInner {
    inboxes: HashMap<NodeId, Sender<Envelope>>,
    dead: HashSet<NodeId>,
}

/// The in-process node registry and router.
pub struct Bus {
    inner: Mutex<BusInner>,
    num_servers: usize,
    num_workers: usize,
}

impl Bus {
    /// Creates a bus for a cluster of the given group sizes.
    pub fn new(num_servers: usize, num_workers: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                inboxes: HashMap::new(),
                dead: HashSet::new(),
            }),
            num_servers,
            num_workers,
        }
    }

    /// Number of server nodes in the cluster.
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// Number of worker nodes in the cluster.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Registers a node and returns its inbox receiver.
    pub fn register(&self, id: NodeId) -> Receiver<Envelope> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        inner.dead.remove(&id);
        inner.inboxes.insert(id, tx);
        rx
    }

    /// Sends a payload to a node or, for a group mask, to every member.
    ///
    /// Sends to dead nodes fail; group fan-out skips them with a warning so
    /// a broadcast is delivered to every surviving member.
    pub fn send(&self, from: NodeId, to: NodeId, payload: Payload) -> Result<()> {
        if node::is_group(to) {
            let targets: Vec<NodeId> = {
                let inner = self.inner.lock();
                inner
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|&id| node::group_of(id) & to != 0)
                    .collect()
            };
            for id in targets {
                if let Err(StoreError::Unreachable(_)) =
                    self.send_one(from, id, payload.clone())
                {
                    warn!(node = id, "dropping broadcast to dead node");
                }
            }
            Ok(())
        } else {
            self.send_one(from, to, payload)
        }
    }

    fn send_one(&self, from: NodeId, to: NodeId, payload: Payload) -> Result<()> {
        let tx = {
            let inner = self.inner.lock();
            inner.inboxes.get(&to).cloned()
        };
        let Some(tx) = tx else {
            return Err(StoreError::Unreachable(to));
        };
        if tx.send(Envelope { from, to, payload }).is_err() {
            // Receiver gone: the node died without deregistering.
            self.mark_dead(to);
            return Err(StoreError::Unreachable(to));
        }
        Ok(())
    }

    /// Currently registered nodes matching a group mask.
    pub fn nodes_in_group(&self, mask: NodeId) -> Vec<NodeId> {
        let inner = self.inner.lock();
        let mut nodes: Vec<NodeId> = inner
            .inboxes
            .keys()
            .copied()
            .filter(|&id| node::group_of(id) & mask != 0)
            .collect();
        nodes.sort_unstable();
        nodes
    }

    /// Marks a node dead, failing all future sends to it.
    pub fn mark_dead(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        inner.inboxes.remove(&id);
        inner.dead.insert(id);
    }

    /// Nodes that have died since the bus was created.
    pub fn dead_nodes(&self) -> Vec<NodeId> {
        let inner = self.inner.lock();
        inner.dead.iter().copied().collect()
    }

    /// True when `id` has been marked dead.
    pub fn is_dead(&self, id: NodeId) -> bool {
        self.inner.lock().dead.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widefm_core::node::{encode, SCHEDULER, SERVER_GROUP, WORKER_GROUP};

    #[test]
    fn test_point_to_point() {
        let bus = Bus::new(1, 1);
        let rx = bus.register(encode(SERVER_GROUP, 0));
        bus.send(SCHEDULER, encode(SERVER_GROUP, 0), Payload::Stop)
            .unwrap();
        assert!(matches!(rx.recv().unwrap().payload, Payload::Stop));
    }

    #[test]
    fn test_group_broadcast() {
        let bus = Bus::new(1, 2);
        let s = bus.register(encode(SERVER_GROUP, 0));
        let w0 = bus.register(encode(WORKER_GROUP, 0));
        let w1 = bus.register(encode(WORKER_GROUP, 1));
        bus.send(SCHEDULER, SERVER_GROUP + WORKER_GROUP, Payload::Stop)
            .unwrap();
        for rx in [&s, &w0, &w1] {
            assert!(matches!(rx.recv().unwrap().payload, Payload::Stop));
        }
    }

    #[test]
    fn test_dead_node_send_fails() {
        let bus = Bus::new(1, 1);
        let id = encode(WORKER_GROUP, 0);
        let _rx = bus.register(id);
        bus.mark_dead(id);
        assert!(matches!(
            bus.send(SCHEDULER, id, Payload::Stop),
            Err(StoreError::Unreachable(_))
        ));
        assert_eq!(bus.dead_nodes(), vec![id]);
    }

    #[test]
    fn test_dropped_receiver_detected() {
        let bus = Bus::new(1, 1);
        let id = encode(WORKER_GROUP, 0);
        let rx = bus.register(id);
        drop(rx);
        assert!(bus.send(SCHEDULER, id, Payload::Stop).is_err());
        assert!(bus.is_dead(id));
    }
}
