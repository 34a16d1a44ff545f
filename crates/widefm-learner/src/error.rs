//! Error types for training orchestration.

use thiserror::Error;

/// The main error type for widefm-learner operations.
#[derive(Debug, Error)]
pub enum LearnerError {
    /// The requested learner name has no implementation.
    #[error("unknown learner `{0}`")]
    UnknownLearner(String),

    /// A required option is missing or ill-formed.
    #[error(transparent)]
    Config(#[from] widefm_core::CoreError),

    /// Data reading or tiling failed.
    #[error(transparent)]
    Data(#[from] widefm_data::DataError),

    /// A loss kernel could not be constructed.
    #[error(transparent)]
    Loss(#[from] widefm_loss::LossError),

    /// Server-side model state failed.
    #[error(transparent)]
    Updater(#[from] widefm_store::UpdaterError),

    /// Model or prediction file I/O.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for widefm-learner operations.
pub type Result<T> = std::result::Result<T, LearnerError>;

impl LearnerError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        LearnerError::Io {
            path: path.into(),
            source,
        }
    }
}
