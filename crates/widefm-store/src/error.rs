//! Error types for the parameter store.

use thiserror::Error;
use widefm_core::node::NodeId;

/// The main error type for widefm-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The destination node is dead or was never registered.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// The transport shut down while an operation was in flight.
    #[error("transport closed")]
    Closed,

    /// Errors bubbled up from widefm-core.
    #[error(transparent)]
    Core(#[from] widefm_core::CoreError),
}

/// Result type alias for widefm-store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
