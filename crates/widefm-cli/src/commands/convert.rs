//! Convert command: rewrite data in canonical libfm form.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use widefm_data::libfm::LibfmOptions;
use widefm_data::{ChunkReader, ReaderConfig};

/// Validate a data URI and rewrite it as canonical libfm text.
///
/// Feature IDs can be byte-reversed on the way through, matching what the
/// trainer would see with `reverse_feaid` enabled.
#[derive(Args, Debug, Clone)]
pub struct ConvertCommand {
    /// Path to the configuration file.
    pub config: Option<PathBuf>,

    /// `key=val` overrides applied after the config file.
    pub overrides: Vec<String>,
}

impl ConvertCommand {
    /// Runs the conversion task.
    pub fn run(&self) -> Result<()> {
        let mut kwargs = super::load_kwargs(&self.config, &self.overrides)?;
        let data_in: String = kwargs.take_required("data_in")?;
        let data_out: String = kwargs.take_required("data_out")?;
        let reverse: bool = kwargs.take_or("reverse_feaid", false)?;
        kwargs.warn_unknown("convert");

        let config = ReaderConfig {
            libfm: LibfmOptions {
                reverse_feaid: reverse,
                fea_group_nbits: 0,
            },
            ..ReaderConfig::whole(&data_in)
        };
        let mut reader = ChunkReader::new(&config)?;
        let output =
            File::create(&data_out).with_context(|| format!("creating {}", data_out))?;
        let mut writer = BufWriter::new(output);

        let mut rows = 0u64;
        while let Some((example, _)) = reader.next_example()? {
            write!(writer, "{}", example.label)?;
            for (field, id, value) in &example.entries {
                if *field != 0 {
                    write!(writer, " {}:{}:{}", field, id, value)?;
                } else if *value != 1.0 {
                    write!(writer, " {}:{}", id, value)?;
                } else {
                    write!(writer, " {}", id)?;
                }
            }
            writeln!(writer)?;
            rows += 1;
        }
        info!("converted {} examples from {} to {}", rows, data_in, data_out);
        Ok(())
    }
}
