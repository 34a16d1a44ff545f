//! Training progress records.
//!
//! A [`Progress`] is a fixed-layout numeric record produced per batch or per
//! job and merged by componentwise addition, so report order across workers
//! is irrelevant. The AUC component is unnormalized (already multiplied by
//! the example count); loss and AUC are divided by the row count only when
//! printed.

use serde::{Deserialize, Serialize};

/// Accumulated training metrics for one batch, job or epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of examples processed.
    pub nrows: f64,
    /// Summed objective value.
    pub loss: f64,
    /// Summed unnormalized AUC (area * batch rows).
    pub auc: f64,
    /// Regularization penalty.
    pub penalty: f64,
    /// Number of nonzero model coefficients.
    pub nnz_w: f64,
}

impl Progress {
    /// Creates a zeroed progress record, the identity for [`merge`].
    ///
    /// [`merge`]: Progress::merge
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `other` into `self`, componentwise.
    pub fn merge(&mut self, other: &Progress) {
        self.nrows += other.nrows;
        self.loss += other.loss;
        self.auc += other.auc;
        self.penalty += other.penalty;
        self.nnz_w += other.nnz_w;
    }

    /// Resets every component to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// One-line human-readable summary with per-row normalization.
    pub fn text_string(&self) -> String {
        format!(
            "Rows = {:.0}, loss = {:.6}, AUC = {:.6}",
            self.nrows,
            self.loss / self.nrows.max(1.0),
            self.auc / self.nrows.max(1.0)
        )
    }
}

/// Periodic progress printer for the scheduler console.
///
/// Keeps cumulative row and nonzero counts across reports, while loss and
/// AUC are averaged over the rows seen since the previous line.
#[derive(Debug, Default)]
pub struct ProgressLine {
    prog: Progress,
    nrows: f64,
    nnz_w: f64,
}

impl ProgressLine {
    /// Creates an empty printer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a freshly reported progress record.
    pub fn merge(&mut self, other: &Progress) {
        self.prog.merge(other);
    }

    /// Formats one report line and resets the windowed counters.
    pub fn print_line(&mut self) -> String {
        self.nrows += self.prog.nrows;
        self.nnz_w += self.prog.nnz_w;
        let line = format!(
            "{:9.4e}  {:7.2e} | {:9.4e} | {:6.4}  {:7.5}",
            self.nrows,
            self.prog.nrows,
            self.nnz_w,
            self.prog.loss / self.prog.nrows.max(1.0),
            self.prog.auc / self.prog.nrows.max(1.0)
        );
        self.prog.reset();
        line
    }
}
