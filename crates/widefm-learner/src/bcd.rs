//! The block-coordinate-descent learner.
//!
//! Training data is tiled by feature block during prepare-data. Each epoch
//! sweeps the blocks in a shuffled order; per block every worker
//!
//! 1. computes, from its tiles, the gradient `g` and curvature `h` of each
//!    kept feature in the block,
//! 2. pushes the `(g, h)` pairs so the servers apply the proximal step,
//! 3. pulls the weight deltas back and patches its cached predictions,
//!
//! so predictions stay current without ever re-reading the data. The
//! objective after the last block of a sweep drives the stop criterion.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info};

use widefm_core::node::{SERVER_GROUP, WORKER_GROUP};
use widefm_core::{FeaId, KwArgs, SArray};
use widefm_data::tile::ColRange;
use widefm_data::{ChunkReader, TileBuilder, TileStore};
use widefm_loss::BinClassMetric;
use widefm_store::{ServerConfig, StoreClient, ValueKind};
use widefm_tracker::{Job, JobType};
use widefm_updater::{remove_tail_features, BcdUpdater, BcdUpdaterParam};

use crate::cluster::{Cluster, ClusterConfig};
use crate::error::Result;
use crate::param::LearnerParam;
use crate::sgd::make_model_executor;
use crate::Learner;

/// Options specific to the BCD learner.
#[derive(Debug, Clone)]
pub struct BcdLearnerParam {
    /// Number of contiguous feature blocks.
    pub num_feature_blocks: usize,
    /// L2 regularizer folded into the per-feature gradient and curvature.
    pub l2: f32,
    /// Bytes per data chunk read during prepare-data, in MB.
    pub data_chunk_size: usize,
}

impl BcdLearnerParam {
    /// Consumes the BCD keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        Ok(Self {
            num_feature_blocks: kwargs.take_or("num_feature_blocks", 8usize)?,
            l2: kwargs.take_or("l2", 0.01f32)?,
            data_chunk_size: kwargs.take_or("data_chunk_size", 256usize)?,
        })
    }
}

/// The BCD learner.
pub struct BcdLearner {
    param: LearnerParam,
    bparam: BcdLearnerParam,
    updater_param: BcdUpdaterParam,
    server_config: ServerConfig,
}

impl BcdLearner {
    /// Builds the learner from the configuration.
    pub fn new(kwargs: &mut KwArgs) -> Result<Self> {
        let param = LearnerParam::init(kwargs)?;
        let bparam = BcdLearnerParam::init(kwargs)?;
        let updater_param = BcdUpdaterParam::init(kwargs)?;
        let server_config = ServerConfig::init(kwargs)?;
        Ok(Self {
            param,
            bparam,
            updater_param,
            server_config,
        })
    }

    fn launch(&self) -> Cluster {
        let cluster_config = ClusterConfig {
            num_servers: self.param.num_servers,
            num_workers: self.param.num_workers,
            server: self.server_config.clone(),
            shuffle_parts: false,
            straggler_timeout: Duration::from_millis(self.param.straggler_timeout),
        };
        let updater_param = self.updater_param.clone();
        let param = self.param.clone();
        let bparam = self.bparam.clone();
        let tail = self.updater_param.tail_feature_filter;
        Cluster::launch(
            &cluster_config,
            move |_rank| Arc::new(BcdUpdater::new(updater_param.clone())),
            {
                let param = param.clone();
                move |rank, updater| make_model_executor(rank, updater, &param)
            },
            move |rank, client| {
                let mut worker =
                    BcdWorker::new(rank, client, param.clone(), bparam.clone(), tail);
                Box::new(move |body: &[u8]| worker.execute(body))
            },
        )
    }
}

impl Learner for BcdLearner {
    fn run(&mut self) -> Result<()> {
        let cluster = self.launch();
        let out = self.run_scheduler(&cluster);
        cluster.shutdown();
        out
    }
}

impl BcdLearner {
    fn run_scheduler(&self, cluster: &Cluster) -> Result<()> {
        let tracker = cluster.tracker();
        info!("scanning data");
        let data = tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::PrepareData, 0));
        let nrows = data.first().copied().unwrap_or(0.0);
        info!("found {} training examples", nrows);

        let kept = tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::InitWorker, 0));
        info!(
            "workers keep {} feature positions after the tail filter",
            kept.first().copied().unwrap_or(0.0)
        );

        let nblocks = self.bparam.num_feature_blocks;
        let mut rng = StdRng::seed_from_u64(self.param.seed);
        let mut pre_objv = 0.0f64;
        for epoch in 0..self.param.max_num_epochs {
            let mut order: Vec<usize> = (0..nblocks).collect();
            if self.param.shuffle_parts {
                order.shuffle(&mut rng);
            }
            let mut objv = 0.0f64;
            for blk in order {
                let rets = tracker.issue_and_wait(
                    WORKER_GROUP,
                    &Job::new(JobType::Train, epoch as i32).with_value(vec![blk as f32]),
                );
                objv = rets.first().copied().unwrap_or(0.0) as f64;
            }
            let eval =
                tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::Evaluate, epoch as i32));
            let auc = eval.first().copied().unwrap_or(0.0) as f64 / (nrows as f64).max(1.0);
            info!(
                "Epoch[{}] objv = {:.6}, AUC = {:.6}",
                epoch,
                objv / (nrows as f64).max(1.0),
                auc
            );

            let eps = (objv - pre_objv).abs() / pre_objv.abs().max(1e-20);
            if epoch > 0 && eps < self.param.stop_rel_objv {
                info!("change of objective [{}] < stop_rel_objv", eps);
                break;
            }
            pre_objv = objv;
        }

        if !self.param.model_out.is_empty() {
            tracker.issue_and_wait(SERVER_GROUP, &Job::new(JobType::SaveModel, -1));
        }
        Ok(())
    }
}

/// Per-worker state of the BCD sweep.
struct BcdWorker {
    rank: usize,
    client: Arc<StoreClient>,
    param: LearnerParam,
    bparam: BcdLearnerParam,
    tail_filter: i32,
    store: Arc<TileStore>,
    builder: Option<TileBuilder>,
    col_ranges: Vec<ColRange>,
    /// Kept keys per column block.
    kept: Vec<SArray<FeaId>>,
    /// Local weights per column block, aligned with `kept`.
    weights: Vec<Vec<f32>>,
    /// Cached predictions per row block.
    preds: Vec<Vec<f32>>,
    /// Labels per row block.
    labels: Vec<Vec<f32>>,
    nblks: usize,
}

impl BcdWorker {
    fn new(
        rank: usize,
        client: Arc<StoreClient>,
        param: LearnerParam,
        bparam: BcdLearnerParam,
        tail_filter: i32,
    ) -> Self {
        let spill_dir = if param.data_cache.is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(&param.data_cache).join(format!("worker-{}", rank)))
        };
        if let Some(dir) = &spill_dir {
            let _ = std::fs::create_dir_all(dir);
        }
        let store = Arc::new(TileStore::new(spill_dir, param.tile_mem_mb << 20));
        let col_ranges = ColRange::split_space(bparam.num_feature_blocks);
        Self {
            rank,
            client,
            param,
            bparam,
            tail_filter,
            builder: Some(TileBuilder::new(Arc::clone(&store))),
            store,
            col_ranges,
            kept: Vec::new(),
            weights: Vec::new(),
            preds: Vec::new(),
            labels: Vec::new(),
            nblks: 0,
        }
    }

    fn execute(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(job) = Job::from_bytes(body) else {
            return Vec::new();
        };
        let rets = match job.job_type {
            JobType::PrepareData => self.prepare_data(),
            JobType::InitWorker => self.init_worker(),
            JobType::Train => {
                self.iterate_feablk(job.value.first().copied().unwrap_or(0.0) as usize)
            }
            JobType::Evaluate => self.evaluate(),
            _ => Ok(Vec::new()),
        };
        match rets {
            Ok(v) => bincode::serialize(&v).unwrap_or_default(),
            Err(e) => {
                error!(rank = self.rank, "job failed: {}", e);
                Vec::new()
            }
        }
    }

    fn prepare_data(&mut self) -> Result<Vec<f32>> {
        let builder = self.builder.as_mut().expect("prepare runs once");
        let config = self.param.reader_config(
            &self.param.data_in,
            self.rank,
            self.param.num_workers,
            self.bparam.data_chunk_size << 20,
        );
        let mut reader = ChunkReader::new(&config)?;
        let (mut nrows, mut nnz) = (0usize, 0usize);
        while let Some(block) = reader.next_block()? {
            nrows += block.size();
            nnz += block.nnz();
            self.labels
                .push(block.label.as_ref().map(|a| a.to_vec()).unwrap_or_default());
            self.preds.push(vec![0.0; block.size()]);
            builder.add(&block, true);
            self.nblks += 1;
        }
        let ts = self.client.push(
            builder.feaids(),
            ValueKind::FeaCount,
            builder.counts(),
            Default::default(),
            None,
        );
        self.client.wait(ts);
        Ok(vec![nrows as f32, self.nblks as f32, nnz as f32])
    }

    fn init_worker(&mut self) -> Result<Vec<f32>> {
        let mut builder = self.builder.take().expect("prepare before init");
        let feaids = builder.feaids();
        let counts = self.client.pull_wait(feaids.clone(), ValueKind::FeaCount);
        let kept_all = remove_tail_features(&feaids, &counts.vals, self.tail_filter);
        builder.build_colmap(&kept_all, &self.col_ranges)?;

        let mut nkept = 0usize;
        for range in &self.col_ranges {
            let (lo, hi) = range.locate(&kept_all);
            let keys: SArray<FeaId> = kept_all[lo..hi].to_vec().into();
            nkept += keys.len();
            self.weights.push(vec![0.0; keys.len()]);
            self.kept.push(keys);
        }
        Ok(vec![nkept as f32])
    }

    /// One coordinate sweep over feature block `blk`.
    fn iterate_feablk(&mut self, blk: usize) -> Result<Vec<f32>> {
        let keys = self.kept[blk].clone();
        if !keys.is_empty() {
            let n = keys.len();
            let mut g = vec![0.0f32; n];
            let mut h = vec![0.0f32; n];
            for i in 0..self.nblks {
                let tile = self.store.fetch(i, blk)?;
                let data = &tile.data;
                for row in 0..data.size() {
                    let pred = self.preds[i][row];
                    let y = if self.labels[i][row] > 0.0 { 1.0f32 } else { -1.0 };
                    let dl = -y / (1.0 + (y * pred).exp());
                    let sigma = 1.0 / (1.0 + (-pred).exp());
                    let d2 = (sigma * (1.0 - sigma)).max(1e-10);
                    for j in data.offset[row]..data.offset[row + 1] {
                        let col = data.index[j] as usize;
                        let pos = tile.colmap[col];
                        if pos < 0 {
                            continue;
                        }
                        let x = data.value.as_ref().map_or(1.0, |a| a[j]);
                        g[pos as usize] += dl * x;
                        h[pos as usize] += d2 * x * x;
                    }
                }
            }
            for (j, (gj, hj)) in g.iter_mut().zip(h.iter_mut()).enumerate() {
                *gj += self.bparam.l2 * self.weights[blk][j];
                *hj += self.bparam.l2;
            }

            // Interleave (g, h) pairs per key.
            let mut vals = Vec::with_capacity(2 * n);
            for j in 0..n {
                vals.push(g[j]);
                vals.push(h[j]);
            }
            let ts = self.client.push(
                keys.clone(),
                ValueKind::Gradient,
                vals.into(),
                Default::default(),
                None,
            );
            self.client.wait(ts);

            let delta = self.client.pull_wait(keys, ValueKind::Weight);
            for (w, &d) in self.weights[blk].iter_mut().zip(delta.vals.iter()) {
                *w += d;
            }
            // Patch the cached predictions with the weight deltas.
            for i in 0..self.nblks {
                let tile = self.store.fetch(i, blk)?;
                let data = &tile.data;
                for row in 0..data.size() {
                    let mut acc = 0.0f32;
                    for j in data.offset[row]..data.offset[row + 1] {
                        let pos = tile.colmap[data.index[j] as usize];
                        if pos < 0 {
                            continue;
                        }
                        let x = data.value.as_ref().map_or(1.0, |a| a[j]);
                        acc += delta.vals[pos as usize] * x;
                    }
                    self.preds[i][row] += acc;
                }
            }
        }

        // Current objective over all cached predictions.
        let mut objv = 0.0f64;
        for (pred, labels) in self.preds.iter().zip(self.labels.iter()) {
            objv += widefm_loss::metric::logit_objv(labels, pred);
        }
        Ok(vec![objv as f32])
    }

    fn evaluate(&mut self) -> Result<Vec<f32>> {
        let mut auc = 0.0f64;
        for (pred, labels) in self.preds.iter().zip(self.labels.iter()) {
            if !labels.is_empty() {
                auc += BinClassMetric::new(labels, pred).auc();
            }
        }
        Ok(vec![auc as f32])
    }
}
