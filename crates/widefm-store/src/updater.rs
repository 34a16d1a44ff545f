//! The server-side updater interface.
//!
//! An updater holds the per-feature optimizer state on one server shard and
//! is invoked by the server endpoint for every pull (`get`) and push
//! (`update`). Implementations live in `widefm-updater`, one per optimizer
//! family; they are chosen by name through that crate's factory.
//!
//! Updaters use interior mutability: the endpoint hands out `&self`, and
//! the contract for concurrent entry updates is that the entry map's lock
//! covers only find-or-insert while numeric updates run on stable entries.

use std::any::Any;
use std::io::{Read, Write};

use thiserror::Error;

use widefm_core::{FeaId, Progress, SArray};

use crate::ValueKind;

/// Errors surfaced by updater operations.
///
/// `KindMismatch` and `DimMismatch` are precondition faults: the server
/// treats them as fatal programmer bugs.
#[derive(Debug, Error)]
pub enum UpdaterError {
    /// The updater does not serve this value kind for this operation.
    #[error("updater cannot handle {kind} for this operation")]
    KindMismatch {
        /// The offending kind.
        kind: ValueKind,
    },

    /// Payload lengths disagree with the key list or the model dimension.
    #[error("dimension mismatch: {0}")]
    DimMismatch(String),

    /// A gradient arrived for a feature with no materialized state.
    #[error("feature {0} has no materialized entry")]
    NotMaterialized(FeaId),

    /// Save/load/dump I/O failure.
    #[error("model i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed model file.
    #[error("corrupt model file: {0}")]
    Corrupt(String),
}

/// Result type alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Per-feature optimizer state with get/update semantics.
pub trait Updater: Send + Sync {
    /// Reads values for `keys`.
    ///
    /// For `Weight` the per-key length is variable (zero for entries that
    /// are not yet materialized); for `FeaCount` every length is one.
    fn get(&self, keys: &SArray<FeaId>, kind: ValueKind) -> Result<(SArray<f32>, SArray<i32>)>;

    /// Applies pushed values for `keys`.
    ///
    /// `FeaCount` accumulates appearance counts and materializes entries
    /// crossing the threshold; `Gradient` applies the optimizer step.
    fn update(
        &self,
        keys: &SArray<FeaId>,
        kind: ValueKind,
        values: &SArray<f32>,
        lens: &SArray<i32>,
    ) -> Result<()>;

    /// Restores state from a binary model stream.
    fn load(&self, reader: &mut dyn Read) -> Result<u64>;

    /// Writes non-empty entries to a binary model stream.
    fn save(&self, save_aux: bool, writer: &mut dyn Write) -> Result<u64>;

    /// Writes non-empty entries as text, one line per feature.
    fn dump(&self, dump_aux: bool, need_reverse: bool, writer: &mut dyn Write) -> Result<u64>;

    /// A progress delta for the periodic server report; resets on read.
    fn report(&self) -> Progress;

    /// Folds model-level statistics (penalty, nonzeros) into `prog`.
    fn evaluate(&self, prog: &mut Progress);

    /// Downcasting hook for learner-specific phases.
    fn as_any(&self) -> &dyn Any;
}
