//! Error types for the WideFM core library.

use thiserror::Error;

/// The main error type for widefm-core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A feature-group ID does not fit in the requested number of bits.
    #[error("invalid feature group id {gid} for {nbits} bits")]
    InvalidGroupId {
        /// The group ID that was provided.
        gid: u64,
        /// The number of bits reserved for group IDs.
        nbits: u32,
    },

    /// A configuration value could not be parsed into its expected type.
    #[error("config key `{key}`: cannot parse `{value}` as {expected}")]
    BadConfigValue {
        /// The offending key.
        key: String,
        /// The raw value.
        value: String,
        /// A description of the expected type.
        expected: &'static str,
    },

    /// A required configuration key is missing.
    #[error("missing required config key `{0}`")]
    MissingConfig(String),

    /// An unrecognized role string in the environment.
    #[error("unknown role `{0}`, expected scheduler, server or worker")]
    UnknownRole(String),

    /// Failure reading a configuration file.
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for widefm-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
