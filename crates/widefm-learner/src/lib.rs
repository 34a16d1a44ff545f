//! Training orchestration.
//!
//! A learner wires up the in-process cluster (server endpoints holding the
//! updater shards, worker executor loops, the scheduler's tracker) and
//! drives training epoch by epoch:
//!
//! - [`SgdLearner`] streams mini-batches through an asynchronous
//!   pull-compute-push pipeline, one data part per job
//! - [`LbfgsLearner`] runs the batched L-BFGS protocol with a Wolfe line
//!   search driven from the scheduler
//! - [`BcdLearner`] sweeps feature blocks with second-order coordinate
//!   steps over the tile store
//!
//! All three share the job transport, the stop criteria shape and the
//! save/load/dump model plumbing.

pub mod bcd;
pub mod cluster;
mod error;
pub mod lbfgs;
pub mod param;
pub mod sgd;

use widefm_core::KwArgs;

pub use bcd::BcdLearner;
pub use cluster::{Cluster, ClusterConfig};
pub use error::{LearnerError, Result};
pub use lbfgs::LbfgsLearner;
pub use param::LearnerParam;
pub use sgd::SgdLearner;

/// A training run, chosen by the `learner` option.
pub trait Learner {
    /// Runs the task to completion (training, prediction) and shuts the
    /// cluster down.
    fn run(&mut self) -> Result<()>;
}

/// Creates a learner by name.
pub fn create_learner(name: &str, kwargs: &mut KwArgs) -> Result<Box<dyn Learner>> {
    match name {
        "sgd" => Ok(Box::new(SgdLearner::new(kwargs)?)),
        "lbfgs" => Ok(Box::new(LbfgsLearner::new(kwargs)?)),
        "bcd" => Ok(Box::new(BcdLearner::new(kwargs)?)),
        other => Err(LearnerError::UnknownLearner(other.to_string())),
    }
}

/// Encodes a progress record as the numeric return of a job.
pub(crate) fn progress_to_vec(p: &widefm_core::Progress) -> Vec<f32> {
    vec![
        p.nrows as f32,
        p.loss as f32,
        p.auc as f32,
        p.penalty as f32,
        p.nnz_w as f32,
    ]
}

/// Decodes a job's numeric return into a progress record.
pub(crate) fn progress_from_vec(v: &[f32]) -> widefm_core::Progress {
    widefm_core::Progress {
        nrows: v.first().copied().unwrap_or(0.0) as f64,
        loss: v.get(1).copied().unwrap_or(0.0) as f64,
        auc: v.get(2).copied().unwrap_or(0.0) as f64,
        penalty: v.get(3).copied().unwrap_or(0.0) as f64,
        nnz_w: v.get(4).copied().unwrap_or(0.0) as f64,
    }
}

/// The per-shard model file name: `<prefix>[_iter-<k>]_part-<rank>`.
pub(crate) fn model_name(prefix: &str, iter: i32, rank: usize) -> String {
    if iter >= 0 {
        format!("{}_iter-{}_part-{}", prefix, iter, rank)
    } else {
        format!("{}_part-{}", prefix, rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widefm_core::Progress;

    #[test]
    fn test_progress_vec_roundtrip() {
        let p = Progress {
            nrows: 3.0,
            loss: 1.5,
            auc: 2.5,
            penalty: 0.25,
            nnz_w: 7.0,
        };
        assert_eq!(progress_from_vec(&progress_to_vec(&p)), p);
    }

    #[test]
    fn test_model_name_scheme() {
        assert_eq!(model_name("m", 3, 1), "m_iter-3_part-1");
        assert_eq!(model_name("m", -1, 0), "m_part-0");
    }

    #[test]
    fn test_unknown_learner() {
        let mut kw = KwArgs::new();
        assert!(matches!(
            create_learner("adamw", &mut kw),
            Err(LearnerError::UnknownLearner(_))
        ));
    }
}
