//! The asynchronous mini-batch learner.
//!
//! The scheduler splits each epoch into `workers × num_jobs_per_epoch`
//! data parts and dispatches them through the tracker. For every part a
//! worker runs a pipelined loop:
//!
//! 1. read a mini-batch and localize its feature IDs (main thread),
//!    pushing appearance counts during the first epoch,
//! 2. pull the current weights for the batch's keys,
//! 3. on pull completion: predict, evaluate, report progress, compute the
//!    gradient,
//! 4. push the gradient; the batch retires when the push is acknowledged.
//!
//! At most two batches are in flight per worker; the reader stalls until
//! the count drops. Validation parts pull and evaluate only; prediction
//! parts additionally write one output line per example.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use widefm_core::node::SERVER_GROUP;
use widefm_core::progress::ProgressLine;
use widefm_core::{KwArgs, Progress};
use widefm_data::{localize, BatchReader};
use widefm_loss::{build_pos, create_loss, BinClassMetric, Loss};
use widefm_store::server::JobExecutor;
use widefm_store::{ServerConfig, StoreClient, Updater, ValueKind};
use widefm_tracker::{Job, JobType, Tracker};
use widefm_updater::{SgdUpdater, SgdUpdaterParam};

use crate::cluster::{Cluster, ClusterConfig};
use crate::error::{LearnerError, Result};
use crate::param::LearnerParam;
use crate::{model_name, progress_from_vec, progress_to_vec, Learner};

/// Callback invoked after every epoch with training and validation
/// progress.
pub type EpochEndCallback = Box<dyn FnMut(usize, &Progress, &Progress) + Send>;

/// The SGD/AdaGrad learner.
pub struct SgdLearner {
    param: LearnerParam,
    updater_param: SgdUpdaterParam,
    server_config: ServerConfig,
    epoch_end: Vec<EpochEndCallback>,
}

impl SgdLearner {
    /// Builds the learner from the configuration.
    pub fn new(kwargs: &mut KwArgs) -> Result<Self> {
        let param = LearnerParam::init(kwargs)?;
        let mut updater_param = SgdUpdaterParam::init(kwargs)?;
        updater_param.seed = param.seed;
        // The fm loss carries a linear coordinate in front of the
        // embedding; logit and ffm use the derived width.
        if param.loss == "fm" {
            updater_param.dim = updater_param.v_dim + 1;
        }
        let server_config = ServerConfig::init(kwargs)?;
        Ok(Self {
            param,
            updater_param,
            server_config,
            epoch_end: Vec::new(),
        })
    }

    /// Registers an epoch-end observer.
    pub fn add_epoch_end_callback(&mut self, cb: EpochEndCallback) {
        self.epoch_end.push(cb);
    }

    fn make_loss(&self) -> Result<Arc<dyn Loss>> {
        Ok(Arc::from(create_loss(
            &self.param.loss,
            self.updater_param.v_dim,
            self.updater_param.field_num,
        )?))
    }

    fn launch(&self) -> Result<Cluster> {
        let loss = self.make_loss()?;
        let cluster_config = ClusterConfig {
            num_servers: self.param.num_servers,
            num_workers: self.param.num_workers,
            server: self.server_config.clone(),
            shuffle_parts: self.param.shuffle_parts,
            straggler_timeout: Duration::from_millis(self.param.straggler_timeout),
        };
        let updater_param = self.updater_param.clone();
        let param = self.param.clone();
        let worker_loss = Arc::clone(&loss);
        let cluster = Cluster::launch(
            &cluster_config,
            move |_rank| Arc::new(SgdUpdater::new(updater_param.clone())),
            {
                let param = param.clone();
                move |rank, updater| make_model_executor(rank, updater, &param)
            },
            move |rank, client| {
                let mut worker = SgdWorker {
                    rank,
                    client,
                    loss: Arc::clone(&worker_loss),
                    param: param.clone(),
                    pred_file_started: false,
                };
                Box::new(move |body: &[u8]| worker.execute(body))
            },
        );
        Ok(cluster)
    }

    fn run_epoch(
        &self,
        tracker: &Arc<Tracker>,
        epoch: i32,
        job_type: JobType,
        report: &Arc<Mutex<ProgressLine>>,
    ) -> Progress {
        let prog = Arc::new(Mutex::new(Progress::new()));
        let merge = Arc::clone(&prog);
        tracker.set_monitor(move |_, rets| {
            if let Ok(v) = bincode::deserialize::<Vec<f32>>(rets) {
                merge.lock().merge(&progress_from_vec(&v));
            }
        });

        let n = self.param.num_workers * self.param.num_jobs_per_epoch;
        tracker.start_dispatch(n, job_type, epoch);
        let interval = Duration::from_secs(self.param.report_interval.max(1));
        let mut last_report = Instant::now();
        while tracker.num_remains() > 0 {
            std::thread::sleep(Duration::from_millis(50));
            if job_type == JobType::Train && last_report.elapsed() >= interval {
                info!("{}", report.lock().print_line());
                last_report = Instant::now();
            }
        }
        let out = *prog.lock();
        out
    }

    fn run_train(&mut self, cluster: &Cluster) -> Result<()> {
        let tracker = cluster.tracker();
        let report = Arc::new(Mutex::new(ProgressLine::new()));
        {
            let report = Arc::clone(&report);
            tracker.set_report_monitor(move |_, bytes| {
                if let Ok(p) = bincode::deserialize::<Progress>(bytes) {
                    report.lock().merge(&p);
                }
            });
        }

        let mut k: i32 = 0;
        if !self.param.model_in.is_empty() {
            info!("loading model from {}", self.param.model_in);
            tracker.issue_and_wait(
                SERVER_GROUP,
                &Job::new(JobType::LoadModel, self.param.load_epoch),
            );
            if self.param.load_epoch >= 0 {
                k = self.param.load_epoch + 1;
            }
        }

        let mut pre_loss = 0.0f64;
        let mut pre_val_auc = 0.0f64;
        while (k as usize) < self.param.max_num_epochs {
            info!("start epoch {}", k);
            let train_prog = self.run_epoch(tracker, k, JobType::Train, &report);
            info!("Epoch[{}] Training: {}", k, train_prog.text_string());

            let mut val_prog = Progress::new();
            if !self.param.data_val.is_empty() {
                val_prog = self.run_epoch(tracker, k, JobType::Validate, &report);
                info!("Epoch[{}] Validation: {}", k, val_prog.text_string());
            }
            for cb in &mut self.epoch_end {
                cb(k as usize, &train_prog, &val_prog);
            }

            let eps = (train_prog.loss - pre_loss).abs() / pre_loss;
            if eps < self.param.stop_rel_objv {
                info!(
                    "change of loss [{}] < stop_rel_objv [{}]",
                    eps, self.param.stop_rel_objv
                );
                break;
            }
            if val_prog.auc > 0.0 {
                let eps = (val_prog.auc - pre_val_auc) / val_prog.nrows;
                if eps < self.param.stop_val_auc {
                    info!(
                        "change of validation AUC [{}] < stop_val_auc [{}]",
                        eps, self.param.stop_val_auc
                    );
                    break;
                }
            }
            pre_loss = train_prog.loss;
            pre_val_auc = val_prog.auc;
            k += 1;
        }

        if !self.param.model_out.is_empty() {
            info!("saving the final model to {}", self.param.model_out);
            tracker.issue_and_wait(SERVER_GROUP, &Job::new(JobType::SaveModel, -1));
        }
        Ok(())
    }

    fn run_predict(&mut self, cluster: &Cluster) -> Result<()> {
        if self.param.model_in.is_empty() {
            return Err(LearnerError::Config(widefm_core::CoreError::MissingConfig(
                "model_in".into(),
            )));
        }
        let tracker = cluster.tracker();
        tracker.issue_and_wait(
            SERVER_GROUP,
            &Job::new(JobType::LoadModel, self.param.load_epoch),
        );
        let report = Arc::new(Mutex::new(ProgressLine::new()));
        let prog = self.run_epoch(tracker, 0, JobType::Predict, &report);
        info!("Prediction: {}", prog.text_string());
        Ok(())
    }
}

impl Learner for SgdLearner {
    fn run(&mut self) -> Result<()> {
        let cluster = self.launch()?;
        let out = if self.param.task == "pred" {
            self.run_predict(&cluster)
        } else {
            self.run_train(&cluster)
        };
        cluster.shutdown();
        out
    }
}

/// Builds the server-side control-job executor shared by all learners:
/// model load/save plus the evaluation fold.
pub(crate) fn make_model_executor(
    rank: usize,
    updater: Arc<dyn Updater>,
    param: &LearnerParam,
) -> JobExecutor {
    let model_in = param.model_in.clone();
    let model_out = param.model_out.clone();
    let has_aux = param.has_aux;
    Box::new(move |body| {
        let Some(job) = Job::from_bytes(body) else {
            return Vec::new();
        };
        match job.job_type {
            JobType::LoadModel => {
                let path = model_name(&model_in, job.epoch, rank);
                match File::open(&path) {
                    Ok(file) => {
                        if let Err(e) = updater.load(&mut BufReader::new(file)) {
                            error!("loading {} failed: {}", path, e);
                        }
                    }
                    Err(e) => error!("cannot open model {}: {}", path, e),
                }
                Vec::new()
            }
            JobType::SaveModel => {
                let path = model_name(&model_out, job.epoch, rank);
                match File::create(&path) {
                    Ok(file) => {
                        let mut w = BufWriter::new(file);
                        if let Err(e) = updater.save(has_aux, &mut w) {
                            error!("saving {} failed: {}", path, e);
                        }
                    }
                    Err(e) => error!("cannot create model {}: {}", path, e),
                }
                Vec::new()
            }
            JobType::Evaluate => {
                let mut prog = Progress::new();
                updater.evaluate(&mut prog);
                bincode::serialize(&progress_to_vec(&prog)).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    })
}

/// Per-worker state of the SGD training loop.
struct SgdWorker {
    rank: usize,
    client: Arc<StoreClient>,
    loss: Arc<dyn Loss>,
    param: LearnerParam,
    pred_file_started: bool,
}

type InFlight = Arc<(Mutex<usize>, Condvar)>;

fn dec_in_flight(in_flight: &InFlight) {
    let (lock, cv) = &**in_flight;
    *lock.lock() -= 1;
    cv.notify_all();
}

impl SgdWorker {
    fn execute(&mut self, body: &[u8]) -> Vec<u8> {
        let Some(job) = Job::from_bytes(body) else {
            return Vec::new();
        };
        match job.job_type {
            JobType::Train | JobType::Validate | JobType::Predict => {
                match self.iterate_data(&job) {
                    Ok(prog) => bincode::serialize(&progress_to_vec(&prog)).unwrap_or_default(),
                    Err(e) => {
                        error!(part = job.part_idx, "aborting part: {}", e);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Streams one data part through the pull-compute-push pipeline.
    fn iterate_data(&mut self, job: &Job) -> Result<Progress> {
        let train = job.job_type == JobType::Train;
        let uri = if job.job_type == JobType::Validate {
            &self.param.data_val
        } else {
            &self.param.data_in
        };
        let config = self.param.reader_config(
            uri,
            job.part_idx.max(0) as usize,
            job.num_parts.max(1) as usize,
            1 << 20,
        );
        let shuffle = if train { self.param.shuffle } else { 0 };
        let neg = if train { self.param.neg_sampling } else { 1.0 };
        let seed = self
            .param
            .seed
            .wrapping_add((job.epoch as u64) << 32)
            .wrapping_add(job.part_idx as u64);
        let mut reader =
            BatchReader::new(&config, self.param.batch_size, shuffle, neg, seed)?;

        let push_cnt = train && job.epoch == 0;
        let prog: Arc<Mutex<Progress>> = Arc::new(Mutex::new(Progress::new()));
        let in_flight: InFlight = Arc::new((Mutex::new(0), Condvar::new()));
        let pred_sink: Arc<Mutex<Vec<(f32, f32)>>> = Arc::new(Mutex::new(Vec::new()));

        while let Some(batch) = reader.next_batch()? {
            let local = localize(&batch, push_cnt);
            if push_cnt {
                let ts = self.client.push(
                    local.feaids.clone(),
                    ValueKind::FeaCount,
                    local.counts.clone().expect("counts requested"),
                    Default::default(),
                    None,
                );
                self.client.wait(ts);
            }

            // At most two batches in flight.
            {
                let (lock, cv) = &*in_flight;
                let mut n = lock.lock();
                while *n >= 2 {
                    cv.wait(&mut n);
                }
                *n += 1;
            }

            let client = Arc::clone(&self.client);
            let loss = Arc::clone(&self.loss);
            let prog = Arc::clone(&prog);
            let in_flight = Arc::clone(&in_flight);
            let pred_sink = Arc::clone(&pred_sink);
            let job_type = job.job_type;
            let feaids = local.feaids.clone();
            let data = local.data;
            self.client.pull(local.feaids, ValueKind::Weight, move |value| {
                let pos = build_pos(&value.lens);
                let mut pred = vec![0.0f32; data.size()];
                loss.predict(&data, &value.vals, &pos, &mut pred);
                let labels: &[f32] = data.label.as_deref().unwrap_or(&[]);
                let objv = loss.evaluate(labels, &pred);
                let auc = BinClassMetric::new(labels, &pred).auc();
                let batch_prog = Progress {
                    nrows: data.size() as f64,
                    loss: objv,
                    auc,
                    ..Default::default()
                };
                prog.lock().merge(&batch_prog);

                match job_type {
                    JobType::Train => {
                        client.report(&batch_prog);
                        let mut grad = vec![0.0f32; value.vals.len()];
                        loss.calc_grad(&data, &value.vals, &pos, &pred, &mut grad);
                        let done = Arc::clone(&in_flight);
                        client.push(
                            feaids,
                            ValueKind::Gradient,
                            grad.into(),
                            value.lens.clone(),
                            Some(Box::new(move || dec_in_flight(&done))),
                        );
                    }
                    JobType::Predict => {
                        let mut sink = pred_sink.lock();
                        for (i, &p) in pred.iter().enumerate() {
                            sink.push((labels.get(i).copied().unwrap_or(0.0), p));
                        }
                        dec_in_flight(&in_flight);
                    }
                    _ => dec_in_flight(&in_flight),
                }
            });
        }

        // Drain the pipeline before the job retires.
        {
            let (lock, cv) = &*in_flight;
            let mut n = lock.lock();
            while *n > 0 {
                cv.wait(&mut n);
            }
        }

        if job.job_type == JobType::Predict && !self.param.pred_out.is_empty() {
            self.save_pred(&pred_sink.lock())?;
        }
        let out = *prog.lock();
        Ok(out)
    }

    fn save_pred(&mut self, rows: &[(f32, f32)]) -> Result<()> {
        let path = format!("{}_part-{}", self.param.pred_out, self.rank);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!self.pred_file_started)
            .append(self.pred_file_started)
            .open(&path)
            .map_err(|e| LearnerError::io(&path, e))?;
        self.pred_file_started = true;
        let mut w = BufWriter::new(file);
        for &(label, pred) in rows {
            let out = if self.param.pred_prob {
                1.0 / (1.0 + (-pred).exp())
            } else {
                pred
            };
            writeln!(w, "{}\t{}", label, out).map_err(|e| LearnerError::io(&path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_consumes_keys() {
        let mut kw = KwArgs::from_args(
            [
                "loss=fm",
                "V_dim=4",
                "lr=0.1",
                "batch_size=16",
                "sync_mode=0",
            ]
            .iter(),
        );
        let learner = SgdLearner::new(&mut kw).unwrap();
        assert!(kw.remaining().is_empty());
        // fm adds the linear coordinate in front of the embedding.
        assert_eq!(learner.updater_param.dim(), 5);
    }
}
