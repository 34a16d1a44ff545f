//! Error types for the WideFM data pipeline.

use thiserror::Error;

/// The main error type for widefm-data operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// An unreadable or missing input file.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A malformed input line.
    #[error("parse error at {path}:{line}: {message}")]
    Parse {
        /// Path of the offending file.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// A row block violating the CSR invariants.
    #[error("invalid row block: {0}")]
    InvalidBlock(String),

    /// The requested data format has no parser.
    #[error("unknown data format `{0}`")]
    UnknownFormat(String),

    /// A tile that is neither cached nor spilled.
    #[error("tile ({0}, {1}) not found")]
    TileNotFound(usize, usize),

    /// Failure serializing or deserializing a spilled tile.
    #[error("tile spill error: {0}")]
    Spill(#[from] bincode::Error),

    /// Errors bubbled up from widefm-core (group codec, config).
    #[error(transparent)]
    Core(#[from] widefm_core::CoreError),
}

/// Result type alias for widefm-data operations.
pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        DataError::Io {
            path: path.into(),
            source,
        }
    }
}
