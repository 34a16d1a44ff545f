//! In-process cluster bring-up.
//!
//! One process hosts every role: server endpoints with their updater
//! shards, worker store clients with executor threads, and the scheduler's
//! tracker. The wire transport named by the role-discovery contract plugs
//! in behind the same bus message surface; the combined-role local mode is
//! what ships here.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use widefm_store::server::JobExecutor;
use widefm_store::{Bus, ServerConfig, ServerNode, StoreClient, Updater};
use widefm_tracker::{run_worker_executor, Tracker};

/// Shape and consistency of the in-process cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of server shards.
    pub num_servers: usize,
    /// Number of workers.
    pub num_workers: usize,
    /// Server consistency settings.
    pub server: ServerConfig,
    /// Randomize workload part assignment.
    pub shuffle_parts: bool,
    /// Straggler timeout for the workload pool.
    pub straggler_timeout: Duration,
}

/// A running cluster: all roles of one training run.
pub struct Cluster {
    bus: Arc<Bus>,
    tracker: Arc<Tracker>,
    server_threads: Vec<JoinHandle<()>>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Launches servers and workers, returning once all are registered.
    ///
    /// `make_updater` builds one updater shard per server rank;
    /// `make_server_executor` builds the control-job handler around it;
    /// `make_worker` builds each worker's job executor from its store
    /// client.
    pub fn launch(
        config: &ClusterConfig,
        make_updater: impl Fn(usize) -> Arc<dyn Updater>,
        make_server_executor: impl Fn(usize, Arc<dyn Updater>) -> JobExecutor,
        make_worker: impl Fn(usize, Arc<StoreClient>) -> Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>,
    ) -> Self {
        let bus = Arc::new(Bus::new(config.num_servers, config.num_workers));
        let tracker = Tracker::new(
            Arc::clone(&bus),
            config.shuffle_parts,
            config.straggler_timeout,
        );

        let server_threads = (0..config.num_servers)
            .map(|rank| {
                let updater = make_updater(rank);
                let executor = make_server_executor(rank, Arc::clone(&updater));
                ServerNode::spawn(
                    Arc::clone(&bus),
                    rank,
                    updater,
                    config.server.clone(),
                    executor,
                )
            })
            .collect();

        let worker_threads = (0..config.num_workers)
            .map(|rank| {
                let (client, ctrl_rx) = StoreClient::new(Arc::clone(&bus), rank);
                let executor = make_worker(rank, Arc::clone(&client));
                let bus = Arc::clone(&bus);
                std::thread::Builder::new()
                    .name(format!("widefm-worker-{}", rank))
                    .spawn(move || {
                        let id = client.node_id();
                        run_worker_executor(bus, id, ctrl_rx, executor);
                        drop(client);
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        info!(
            servers = config.num_servers,
            workers = config.num_workers,
            "cluster launched"
        );
        Cluster {
            bus,
            tracker,
            server_threads,
            worker_threads,
        }
    }

    /// The message bus.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// The scheduler's tracker.
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Two-phase stop: drain outstanding jobs, broadcast stop, join all.
    pub fn shutdown(mut self) {
        self.tracker.stop();
        for h in self.worker_threads.drain(..) {
            let _ = h.join();
        }
        for h in self.server_threads.drain(..) {
            let _ = h.join();
        }
        info!("cluster shut down");
    }
}
