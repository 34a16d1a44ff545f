//! WideFM CLI library.
//!
//! This crate provides the command-line interface to WideFM:
//!
//! - **Train**: distributed FM/FFM/linear training (the default task)
//! - **Pred**: prediction with a trained model
//! - **Dump**: render a binary model file as text
//! - **Convert**: rewrite a data file in canonical libfm form
//!
//! # Example
//!
//! ```bash
//! # Train with a config file plus overrides
//! widefm train train.conf lr=0.05 max_num_epochs=10
//!
//! # Dump a saved model, undoing the ingest byte reversal
//! widefm dump model_in=model_part-0 need_reverse=1 name_dump=model.txt
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{ConvertCommand, DumpCommand, PredCommand, TrainCommand};

/// WideFM - sparse factorization-machine training at 64-bit feature scale.
#[derive(Parser, Debug)]
#[command(name = "widefm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The task to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI tasks, mutually exclusive.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model (the default task).
    Train(TrainCommand),

    /// Predict with a trained model.
    Pred(PredCommand),

    /// Dump a binary model file to readable text.
    Dump(DumpCommand),

    /// Convert a data file to canonical libfm form.
    Convert(ConvertCommand),
}
