//! CLI command implementations.

mod convert;
mod dump;
mod train;

pub use convert::ConvertCommand;
pub use dump::DumpCommand;
pub use train::{PredCommand, TrainCommand};

use std::path::PathBuf;

use widefm_core::KwArgs;

/// Assembles the configuration from an optional file plus `key=val`
/// overrides, later entries winning.
pub(crate) fn load_kwargs(
    config: &Option<PathBuf>,
    overrides: &[String],
) -> anyhow::Result<KwArgs> {
    let mut kwargs = match config {
        Some(path) => KwArgs::from_file(path)?,
        None => KwArgs::new(),
    };
    kwargs.extend(KwArgs::from_args(overrides.iter()));
    Ok(kwargs)
}
