//! Train and predict commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use widefm_core::Role;
use widefm_learner::create_learner;

/// Train a model.
///
/// Configuration comes from an optional config file of `key = value` lines
/// plus trailing `key=val` arguments; later entries win. The learner is
/// picked by the `learner` option (`sgd`, `bcd` or `lbfgs`).
///
/// # Example
///
/// ```bash
/// widefm train train.conf data_in=train.libfm lr=0.05
/// ```
#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Path to the configuration file.
    pub config: Option<PathBuf>,

    /// `key=val` overrides applied after the config file.
    pub overrides: Vec<String>,
}

impl TrainCommand {
    /// Runs the training task.
    pub fn run(&self) -> Result<()> {
        run_learner_task(&self.config, &self.overrides, None)
    }
}

/// Predict with a trained model.
///
/// Requires `model_in`; writes one line per example to
/// `<pred_out>_part-<rank>`.
#[derive(Args, Debug, Clone)]
pub struct PredCommand {
    /// Path to the configuration file.
    pub config: Option<PathBuf>,

    /// `key=val` overrides applied after the config file.
    pub overrides: Vec<String>,
}

impl PredCommand {
    /// Runs the prediction task.
    pub fn run(&self) -> Result<()> {
        run_learner_task(&self.config, &self.overrides, Some("pred"))
    }
}

fn run_learner_task(
    config: &Option<PathBuf>,
    overrides: &[String],
    task: Option<&str>,
) -> Result<()> {
    let role = Role::from_env()?;
    if role != Role::Local {
        warn!(
            ?role,
            "no wire transport is configured, running the combined-role local mode"
        );
    }

    let mut kwargs = super::load_kwargs(config, overrides)?;
    if let Some(task) = task {
        kwargs.push("task", task);
    }
    let learner_name: String = kwargs.take_or("learner", "sgd".to_string())?;
    info!(learner = %learner_name, "starting");
    let mut learner = create_learner(&learner_name, &mut kwargs)
        .with_context(|| format!("creating learner `{}`", learner_name))?;
    kwargs.warn_unknown(&learner_name);
    learner.run().context("training failed")?;
    Ok(())
}
