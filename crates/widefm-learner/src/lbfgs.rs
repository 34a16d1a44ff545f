//! The L-BFGS learner.
//!
//! A batched optimizer over the tile store. One epoch is one quasi-Newton
//! iteration:
//!
//! 1. workers push their accumulated gradients,
//! 2. servers emit the Gram matrices of the `(s, y)` history
//!    (`PrepareDirection`), summed across shards by the tracker,
//! 3. the scheduler solves the compact inverse-Hessian representation and
//!    sends combination coefficients back (`CalcDirection`), receiving
//!    `⟨p, ∇f⟩`,
//! 4. a backtracking line search shrinks α by `rho` until both Wolfe
//!    conditions hold: Armijo sufficient decrease with `c1` and the
//!    curvature condition with `c2`.
//!
//! Workers keep their weight slices locally, moving them by `α·p` per line
//! search probe; servers mirror the movement so the saved model and the
//! next `(s, y)` pair agree.

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{error, info, warn};

use widefm_core::node::{SERVER_GROUP, WORKER_GROUP};
use widefm_core::{FeaId, KwArgs, SArray};
use widefm_data::tile::ColRange;
use widefm_data::{ChunkReader, TileBuilder, TileStore};
use widefm_loss::{create_loss, BinClassMetric, Loss, Pos};
use widefm_store::{ServerConfig, StoreClient, Updater, ValueKind};
use widefm_tracker::{Job, JobType};
use widefm_updater::{remove_tail_features, LbfgsUpdater, LbfgsUpdaterParam};

use crate::cluster::{Cluster, ClusterConfig};
use crate::error::Result;
use crate::param::LearnerParam;
use crate::sgd::make_model_executor;
use crate::Learner;

/// Options specific to the L-BFGS learner.
#[derive(Debug, Clone)]
pub struct LbfgsLearnerParam {
    /// Armijo sufficient-decrease constant.
    pub c1: f32,
    /// Curvature constant.
    pub c2: f32,
    /// Step-size shrink factor.
    pub rho: f32,
    /// Maximal line-search probes per epoch.
    pub max_num_linesearchs: usize,
    /// Epochs before the stop criteria are consulted.
    pub min_num_epochs: usize,
    /// Initial step size of the first epoch; 0 derives `ntrain / nnz`.
    pub init_alpha: f32,
    /// Initial step size of later epochs.
    pub alpha: f32,
    /// Power applied to gradient magnitudes; 1 leaves them untouched.
    pub gamma: f32,
    /// Bytes per data chunk read during prepare-data, in MB.
    pub data_chunk_size: usize,
}

impl LbfgsLearnerParam {
    /// Consumes the L-BFGS keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        Ok(Self {
            c1: kwargs.take_or("c1", 1e-4f32)?,
            c2: kwargs.take_or("c2", 0.9f32)?,
            rho: kwargs.take_or("rho", 0.5f32)?,
            max_num_linesearchs: kwargs.take_or("max_num_linesearchs", 10usize)?,
            min_num_epochs: kwargs.take_or("min_num_epochs", 1usize)?,
            init_alpha: kwargs.take_or("init_alpha", 0.0f32)?,
            alpha: kwargs.take_or("alpha", 1.0f32)?,
            gamma: kwargs.take_or("gamma", 1.0f32)?,
            data_chunk_size: kwargs.take_or("data_chunk_size", 256usize)?,
        })
    }
}

/// The L-BFGS learner.
pub struct LbfgsLearner {
    param: LearnerParam,
    lparam: LbfgsLearnerParam,
    updater_param: LbfgsUpdaterParam,
    server_config: ServerConfig,
}

impl LbfgsLearner {
    /// Builds the learner from the configuration.
    pub fn new(kwargs: &mut KwArgs) -> Result<Self> {
        let param = LearnerParam::init(kwargs)?;
        let lparam = LbfgsLearnerParam::init(kwargs)?;
        let updater_param = LbfgsUpdaterParam::init(kwargs)?;
        let server_config = ServerConfig::init(kwargs)?;
        Ok(Self {
            param,
            lparam,
            updater_param,
            server_config,
        })
    }

    fn launch(&self) -> Result<Cluster> {
        let loss: Arc<dyn Loss> = Arc::from(create_loss(&self.param.loss, 0, 0)?);
        let cluster_config = ClusterConfig {
            num_servers: self.param.num_servers,
            num_workers: self.param.num_workers,
            server: self.server_config.clone(),
            shuffle_parts: false,
            straggler_timeout: Duration::from_millis(self.param.straggler_timeout),
        };
        let updater_param = self.updater_param.clone();
        let param = self.param.clone();
        let lparam = self.lparam.clone();
        let tail = self.updater_param.tail_feature_filter;
        Ok(Cluster::launch(
            &cluster_config,
            move |_rank| Arc::new(LbfgsUpdater::new(updater_param.clone())),
            {
                let param = param.clone();
                move |rank, updater| {
                    let model = make_model_executor(rank, Arc::clone(&updater), &param);
                    make_lbfgs_server_executor(updater, model)
                }
            },
            move |rank, client| {
                let mut worker = LbfgsWorker::new(
                    rank,
                    client,
                    Arc::clone(&loss),
                    param.clone(),
                    lparam.clone(),
                    tail,
                );
                Box::new(move |body: &[u8]| worker.execute(body))
            },
        ))
    }
}

impl Learner for LbfgsLearner {
    fn run(&mut self) -> Result<()> {
        let cluster = self.launch()?;
        let out = self.run_scheduler(&cluster);
        cluster.shutdown();
        out
    }
}

impl LbfgsLearner {
    fn run_scheduler(&self, cluster: &Cluster) -> Result<()> {
        let tracker = cluster.tracker();
        info!("scanning data");
        let data = tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::PrepareData, 0));
        let (ntrain, nnz, nval) = (
            data.first().copied().unwrap_or(0.0),
            data.get(2).copied().unwrap_or(1.0),
            data.get(3).copied().unwrap_or(0.0),
        );
        info!(
            "found {} training examples in {} chunks",
            ntrain,
            data.get(1).copied().unwrap_or(0.0)
        );

        let server = tracker.issue_and_wait(SERVER_GROUP, &Job::new(JobType::InitServer, 0));
        info!(
            "inited model with {} parameters",
            server.get(1).copied().unwrap_or(0.0)
        );
        let worker = tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::InitWorker, 0));
        let mut objv = (server.first().copied().unwrap_or(0.0)
            + worker.first().copied().unwrap_or(0.0)) as f64;

        let mut val_auc = 0.0f64;
        for k in 0..self.param.max_num_epochs {
            info!("epoch {}", k);
            tracker.issue_and_wait(WORKER_GROUP, &Job::new(JobType::PushGradient, k as i32));
            let prods =
                tracker.issue_and_wait(SERVER_GROUP, &Job::new(JobType::PrepareDirection, k as i32));
            let coeffs = solve_direction(&prods, self.param.num_servers);
            let p_gf = tracker
                .issue_and_wait(
                    SERVER_GROUP,
                    &Job::new(JobType::CalcDirection, k as i32).with_value(coeffs),
                )
                .first()
                .copied()
                .unwrap_or(0.0) as f64;

            let mut alpha = if k == 0 {
                if self.lparam.init_alpha > 0.0 {
                    self.lparam.init_alpha
                } else {
                    (ntrain / nnz.max(1.0)).max(1e-4)
                }
            } else {
                self.lparam.alpha
            };
            info!("start linesearch with objv = {}, <p,g> = {}", objv, p_gf);

            let mut new_objv = objv;
            for i in 0..self.lparam.max_num_linesearchs {
                let status = tracker.issue_and_wait(
                    WORKER_GROUP + SERVER_GROUP,
                    &Job::new(JobType::LineSearch, k as i32).with_value(vec![alpha]),
                );
                new_objv = status.first().copied().unwrap_or(0.0) as f64;
                let pg_new = status.get(1).copied().unwrap_or(0.0) as f64;
                info!("alpha = {}, objv = {}, <p,g> = {}", alpha, new_objv, pg_new);
                if new_objv <= objv + (self.lparam.c1 * alpha) as f64 * p_gf
                    && pg_new >= self.lparam.c2 as f64 * p_gf
                {
                    info!("wolfe conditions are satisfied");
                    break;
                }
                if i + 1 == self.lparam.max_num_linesearchs {
                    warn!("reached the maximal number of linesearch steps");
                }
                alpha *= self.lparam.rho;
            }

            let eval = tracker.issue_and_wait(
                WORKER_GROUP + SERVER_GROUP,
                &Job::new(JobType::Evaluate, k as i32),
            );
            let train_auc = eval.first().copied().unwrap_or(0.0) as f64 / ntrain.max(1.0) as f64;
            info!("training AUC = {:.6}", train_auc);
            let new_val_auc = if nval > 0.0 {
                let auc = eval.get(1).copied().unwrap_or(0.0) as f64 / nval as f64;
                info!("validation AUC = {:.6}", auc);
                auc
            } else {
                0.0
            };

            if k > self.lparam.min_num_epochs {
                let eps = (new_objv - objv).abs() / objv.abs().max(1e-20);
                if eps < self.param.stop_rel_objv {
                    info!("change of objective [{}] < stop_rel_objv", eps);
                    objv = new_objv;
                    break;
                }
                if nval > 0.0 && new_val_auc - val_auc < self.param.stop_val_auc {
                    info!("change of validation AUC < stop_val_auc");
                    break;
                }
            }
            objv = new_objv;
            val_auc = new_val_auc;
        }
        info!("training is done, final objv = {}", objv);

        if !self.param.model_out.is_empty() {
            tracker.issue_and_wait(SERVER_GROUP, &Job::new(JobType::SaveModel, -1));
        }
        Ok(())
    }
}

/// Builds the server executor handling the L-BFGS phases, falling back to
/// the shared model executor for load/save/evaluate.
fn make_lbfgs_server_executor(
    updater: Arc<dyn Updater>,
    mut model: widefm_store::server::JobExecutor,
) -> widefm_store::server::JobExecutor {
    Box::new(move |body| {
        let Some(job) = Job::from_bytes(body) else {
            return Vec::new();
        };
        let Some(lbfgs) = updater.as_any().downcast_ref::<LbfgsUpdater>() else {
            return Vec::new();
        };
        match job.job_type {
            JobType::InitServer => {
                let nparams = lbfgs.init_weight();
                bincode::serialize(&vec![0.0f32, nparams as f32]).unwrap_or_default()
            }
            JobType::PrepareDirection => {
                bincode::serialize(&lbfgs.prepare_calc_direction()).unwrap_or_default()
            }
            JobType::CalcDirection => {
                let pg = lbfgs.calc_direction(&job.value) as f32;
                bincode::serialize(&vec![pg]).unwrap_or_default()
            }
            JobType::LineSearch => {
                lbfgs.line_search(job.value.first().copied().unwrap_or(0.0));
                Vec::new()
            }
            _ => model(body),
        }
    })
}

/// Solves the compact inverse-Hessian representation.
///
/// `prods` is the shard-summed output of `prepare_calc_direction`; the
/// returned coefficients `[γ, a, b]` reconstruct `p = −(γg + Sa + γYb)`.
/// The Gram block `SᵀY` is factor-free: its upper triangle `R` is solved
/// by substitution.
pub fn solve_direction(prods: &[f32], _num_servers: usize) -> Vec<f32> {
    // Recover t from len = 3t² + 2t + 2.
    let mut t = 0usize;
    while 3 * (t + 1) * (t + 1) + 2 * (t + 1) + 2 <= prods.len() {
        t += 1;
    }
    let sy = &prods[0..t * t];
    let yy = &prods[2 * t * t..3 * t * t];
    let sg = &prods[3 * t * t..3 * t * t + t];
    let yg = &prods[3 * t * t + t..3 * t * t + 2 * t];
    let sy_last = prods.get(3 * t * t + 2 * t).copied().unwrap_or(0.0);
    let yy_last = prods.get(3 * t * t + 2 * t + 1).copied().unwrap_or(0.0);

    let gamma = if yy_last > 0.0 { sy_last / yy_last } else { 1.0 };
    if t == 0 {
        return vec![1.0];
    }
    // Degenerate curvature: fall back to scaled steepest descent.
    for i in 0..t {
        if sy[i * t + i].abs() < 1e-12 {
            let mut coeffs = vec![0.0; 1 + 2 * t];
            coeffs[0] = gamma;
            return coeffs;
        }
    }

    // q = R⁻¹·Sᵀg with R the upper triangle of SᵀY.
    let mut q = vec![0.0f64; t];
    for i in (0..t).rev() {
        let mut acc = sg[i] as f64;
        for j in i + 1..t {
            acc -= sy[i * t + j] as f64 * q[j];
        }
        q[i] = acc / sy[i * t + i] as f64;
    }
    // v = (D + γ·YᵀY)·q − γ·Yᵀg
    let mut v = vec![0.0f64; t];
    for i in 0..t {
        let mut acc = sy[i * t + i] as f64 * q[i] - gamma as f64 * yg[i] as f64;
        for j in 0..t {
            acc += gamma as f64 * yy[i * t + j] as f64 * q[j];
        }
        v[i] = acc;
    }
    // a = R⁻ᵀ·v by forward substitution.
    let mut a = vec![0.0f64; t];
    for i in 0..t {
        let mut acc = v[i];
        for j in 0..i {
            acc -= sy[j * t + i] as f64 * a[j];
        }
        a[i] = acc / sy[i * t + i] as f64;
    }

    let mut coeffs = Vec::with_capacity(1 + 2 * t);
    coeffs.push(gamma);
    coeffs.extend(a.iter().map(|&x| x as f32));
    coeffs.extend(q.iter().map(|&x| -x as f32));
    coeffs
}

/// Per-worker state of the L-BFGS protocol.
struct LbfgsWorker {
    rank: usize,
    client: Arc<StoreClient>,
    loss: Arc<dyn Loss>,
    param: LearnerParam,
    lparam: LbfgsLearnerParam,
    tail_filter: i32,
    store: Arc<TileStore>,
    builder: Option<TileBuilder>,
    feaids: SArray<FeaId>,
    weights: Vec<f32>,
    grads: Vec<f32>,
    directions: Vec<f32>,
    alpha_applied: f32,
    ntrain_blks: usize,
    nval_blks: usize,
    train_auc: f64,
}

impl LbfgsWorker {
    fn new(
        rank: usize,
        client: Arc<StoreClient>,
        loss: Arc<dyn Loss>,
        param: LearnerParam,
        lparam: LbfgsLearnerParam,
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
        Self {
            rank,
            client,
            loss,
            param,
            lparam,
            tail_filter,
            builder: Some(TileBuilder::new(Arc::clone(&store))),
            store,
            feaids: Default::default(),
            weights: Vec::new(),
            grads: Vec::new(),
            directions: Vec::new(),
            alpha_applied: 0.0,
            ntrain_blks: 0,
            nval_blks: 0,
            train_auc: 0.0,
        }
    }

    fn execute(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(job) = Job::from_bytes(body) else {
            return Vec::new();
        };
        let rets = match job.job_type {
            JobType::PrepareData => self.prepare_data(),
            JobType::InitWorker => self.init_worker(),
            JobType::PushGradient => {
                self.directions.clear();
                let ts = self.client.push(
                    self.feaids.clone(),
                    ValueKind::Gradient,
                    self.grads.clone().into(),
                    Default::default(),
                    None,
                );
                self.client.wait(ts);
                Ok(Vec::new())
            }
            JobType::LineSearch => self.line_search(job.value.first().copied().unwrap_or(0.0)),
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
        let chunk = self.lparam.data_chunk_size << 20;
        let builder = self.builder.as_mut().expect("prepare runs once");
        let config = self.param.reader_config(
            &self.param.data_in,
            self.rank,
            self.param.num_workers,
            chunk,
        );
        let mut reader = ChunkReader::new(&config)?;
        let (mut nrows, mut nnz) = (0usize, 0usize);
        while let Some(block) = reader.next_block()? {
            nrows += block.size();
            nnz += block.nnz();
            builder.add(&block, true);
            self.ntrain_blks += 1;
        }
        let mut rets = vec![
            nrows as f32,
            self.ntrain_blks as f32,
            nnz as f32,
            0.0,
            0.0,
            0.0,
        ];

        let ts = self.client.push(
            builder.feaids(),
            ValueKind::FeaCount,
            builder.counts(),
            Default::default(),
            None,
        );

        if !self.param.data_val.is_empty() {
            let config = self.param.reader_config(
                &self.param.data_val,
                self.rank,
                self.param.num_workers,
                chunk,
            );
            let mut reader = ChunkReader::new(&config)?;
            let (mut vrows, mut vnnz) = (0usize, 0usize);
            while let Some(block) = reader.next_block()? {
                vrows += block.size();
                vnnz += block.nnz();
                builder.add(&block, false);
                self.nval_blks += 1;
            }
            rets[3] = vrows as f32;
            rets[4] = self.nval_blks as f32;
            rets[5] = vnnz as f32;
        }
        self.client.wait(ts);
        Ok(rets)
    }

    fn init_worker(&mut self) -> Result<Vec<f32>> {
        let mut builder = self.builder.take().expect("prepare before init");
        let feaids = builder.feaids();
        let counts = self.client.pull_wait(feaids.clone(), ValueKind::FeaCount);
        let kept = remove_tail_features(&feaids, &counts.vals, self.tail_filter);
        builder.build_colmap(&kept, &[ColRange { begin: 0, end: u64::MAX }])?;
        self.feaids = kept.into();

        let pulled = self.client.pull_wait(self.feaids.clone(), ValueKind::Weight);
        self.weights = pulled.vals.to_vec();
        let objv = self.calc_grad()?;
        Ok(vec![objv as f32])
    }

    fn line_search(&mut self, alpha: f32) -> Result<Vec<f32>> {
        if self.directions.is_empty() {
            let pulled = self.client.pull_wait(self.feaids.clone(), ValueKind::Weight);
            self.directions = pulled.vals.to_vec();
            self.alpha_applied = 0.0;
        }
        let step = alpha - self.alpha_applied;
        for (w, &p) in self.weights.iter_mut().zip(self.directions.iter()) {
            *w += step * p;
        }
        self.alpha_applied = alpha;
        let objv = self.calc_grad()?;
        let pg: f64 = self
            .grads
            .iter()
            .zip(self.directions.iter())
            .map(|(&g, &p)| g as f64 * p as f64)
            .sum();
        Ok(vec![objv as f32, pg as f32])
    }

    /// Full-data objective and gradient at the current weights.
    fn calc_grad(&mut self) -> Result<f64> {
        for i in 0..self.ntrain_blks {
            self.store.prefetch(i, 0)?;
        }
        let n = self.feaids.len();
        let weights: SArray<f32> = self.weights.clone().into();
        let loss = &self.loss;
        let store = &self.store;
        let parts: Vec<(f64, f64, Vec<f32>)> = (0..self.ntrain_blks)
            .into_par_iter()
            .map(|i| {
                let tile = store.fetch(i, 0).expect("prefetched tile");
                let pos = Pos {
                    w_pos: tile.colmap.clone(),
                    v_pos: Default::default(),
                };
                let mut pred = vec![0.0f32; tile.data.size()];
                loss.predict(&tile.data, &weights, &pos, &mut pred);
                let labels: &[f32] = tile.data.label.as_deref().unwrap_or(&[]);
                let objv = loss.evaluate(labels, &pred);
                let auc = BinClassMetric::new(labels, &pred).auc();
                let mut grad = vec![0.0f32; n];
                loss.calc_grad(&tile.data, &weights, &pos, &pred, &mut grad);
                (objv, auc, grad)
            })
            .collect();

        let mut objv = 0.0;
        let mut auc = 0.0;
        self.grads = vec![0.0; n];
        for (o, a, g) in parts {
            objv += o;
            auc += a;
            for (acc, v) in self.grads.iter_mut().zip(g) {
                *acc += v;
            }
        }
        if self.lparam.gamma != 1.0 {
            for g in self.grads.iter_mut() {
                *g = g.signum() * g.abs().powf(self.lparam.gamma);
            }
        }
        self.train_auc = auc;
        Ok(objv)
    }

    /// Training AUC from the last gradient pass plus the validation AUC.
    fn evaluate(&mut self) -> Result<Vec<f32>> {
        let weights: SArray<f32> = self.weights.clone().into();
        let mut val_auc = 0.0f64;
        for i in self.ntrain_blks..self.ntrain_blks + self.nval_blks {
            let tile = self.store.fetch(i, 0)?;
            let pos = Pos {
                w_pos: tile.colmap.clone(),
                v_pos: Default::default(),
            };
            let mut pred = vec![0.0f32; tile.data.size()];
            self.loss.predict(&tile.data, &weights, &pos, &mut pred);
            let labels: &[f32] = tile.data.label.as_deref().unwrap_or(&[]);
            val_auc += BinClassMetric::new(labels, &pred).auc();
        }
        Ok(vec![self.train_auc as f32, val_auc as f32])
    }
}
