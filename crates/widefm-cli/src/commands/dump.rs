//! Dump command: binary model file to readable text.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::info;

use widefm_updater::{create_updater, Updater};

/// Dump a saved model as text, one `key<TAB>size<TAB>V...` line per entry.
///
/// # Example
///
/// ```bash
/// widefm dump model_in=model_part-0 name_dump=model.txt need_reverse=1
/// ```
#[derive(Args, Debug, Clone)]
pub struct DumpCommand {
    /// Path to the configuration file.
    pub config: Option<PathBuf>,

    /// `key=val` overrides applied after the config file.
    pub overrides: Vec<String>,
}

impl DumpCommand {
    /// Runs the dump task.
    pub fn run(&self) -> Result<()> {
        let mut kwargs = super::load_kwargs(&self.config, &self.overrides)?;
        let updater_name: String = kwargs.take_or("updater", "sgd".to_string())?;
        let model_in: String = kwargs.take_required("model_in")?;
        let name_dump: String = kwargs.take_or("name_dump", "dump.txt".to_string())?;
        let need_reverse: bool = kwargs.take_or("need_reverse", false)?;
        let dump_aux: bool = kwargs.take_or("dump_aux", false)?;

        let Some(updater) = create_updater(&updater_name, &mut kwargs)? else {
            bail!("unknown updater `{}`", updater_name);
        };
        kwargs.warn_unknown("dump");

        let input = File::open(&model_in).with_context(|| format!("opening {}", model_in))?;
        let loaded = updater.load(&mut BufReader::new(input))?;
        info!("loaded {} entries from {}", loaded, model_in);

        let output =
            File::create(&name_dump).with_context(|| format!("creating {}", name_dump))?;
        let mut writer = BufWriter::new(output);
        let dumped = updater.dump(dump_aux, need_reverse, &mut writer)?;
        info!("dumped {} entries to {}", dumped, name_dump);
        Ok(())
    }
}
