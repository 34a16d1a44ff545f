//! Server-side updaters.
//!
//! An updater is the per-feature optimizer state living on one server
//! shard, invoked through the [`Updater`] trait for every push and pull.
//! One implementation exists per optimizer family:
//!
//! - [`SgdUpdater`] - FM/FFM embeddings updated by AdaGrad, materialized
//!   once a feature's appearance count crosses `V_threshold`
//! - [`BcdUpdater`] - linear weights updated by a proximal L1 step over
//!   feature blocks, with per-feature step bounds
//! - [`LbfgsUpdater`] - linear weights plus the (s, y) ring buffer of the
//!   limited-memory BFGS approximation and its line-search state
//!
//! The factory [`create_updater`] picks the implementation by learner name
//! and consumes the updater's configuration keys.

pub mod bcd;
pub mod kv;
pub mod lbfgs;
pub mod sgd;

use std::sync::Arc;

use widefm_core::KwArgs;
pub use widefm_store::{Updater, UpdaterError, ValueKind};

pub use bcd::{BcdUpdater, BcdUpdaterParam};
pub use kv::{kv_match, merge_counts, remove_tail_features, AssignOp};
pub use lbfgs::{LbfgsUpdater, LbfgsUpdaterParam};
pub use sgd::{SgdUpdater, SgdUpdaterParam};

/// Creates the updater matching a learner name.
pub fn create_updater(
    learner: &str,
    kwargs: &mut KwArgs,
) -> widefm_core::Result<Option<Arc<dyn Updater>>> {
    match learner {
        "sgd" => Ok(Some(Arc::new(SgdUpdater::new(SgdUpdaterParam::init(
            kwargs,
        )?)))),
        "bcd" => Ok(Some(Arc::new(BcdUpdater::new(BcdUpdaterParam::init(
            kwargs,
        )?)))),
        "lbfgs" => Ok(Some(Arc::new(LbfgsUpdater::new(LbfgsUpdaterParam::init(
            kwargs,
        )?)))),
        _ => Ok(None),
    }
}
