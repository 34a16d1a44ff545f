//! The worker-side executor loop.
//!
//! Workers receive control messages through the receiver their store
//! client hands out; this loop turns each [`Job`](crate::Job) body into a
//! result via the learner's executor closure and replies to the tracker.
//! It exits on `Stop`, on transport shutdown, or when the scheduler is
//! found dead (non-scheduler nodes do not outlive the scheduler).

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{error, info};

use widefm_core::node::{self, NodeId};
use widefm_store::{Bus, Envelope, Payload};

/// Runs jobs for one worker until stopped.
pub fn run_worker_executor(
    bus: Arc<Bus>,
    my_id: NodeId,
    ctrl_rx: Receiver<Envelope>,
    mut executor: impl FnMut(&[u8]) -> Vec<u8>,
) {
    loop {
        let env = match ctrl_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(env) => env,
            Err(RecvTimeoutError::Timeout) => {
                if bus.is_dead(node::SCHEDULER) {
                    error!(node = my_id, "scheduler died, stopping worker");
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        match env.payload {
            Payload::Job { dispatch, body } => {
                let rets = executor(&body);
                let _ = bus.send(my_id, env.from, Payload::JobDone { dispatch, rets });
            }
            Payload::Stop => {
                info!(node = my_id, "worker stopped");
                return;
            }
            _ => {}
        }
    }
}
