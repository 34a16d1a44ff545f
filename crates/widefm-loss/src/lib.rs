//! Loss kernels.
//!
//! A loss computes predictions and gradients for a localized row block
//! against the packed weight vector a worker pulled from the servers. The
//! weight vector is packed: entry `i` of the pulled key list occupies
//! `lens[i]` consecutive coordinates (zero for features without
//! materialized state). A [`Pos`] built from those lengths maps each packed
//! column to its positions in the weight vector, with `-1` marking columns
//! to skip.
//!
//! Three kernels are provided, chosen by name through [`create_loss`]:
//!
//! - `logit` - plain sparse logistic regression over the entries' leading
//!   coordinate
//! - `fm` - factorization machine: a linear term plus pairwise interactions
//!   through the `‖Vx‖²` identity
//! - `ffm` - field-aware FM over per-field embedding slices
//!
//! The logistic link is shared: `∂ℓ/∂pred = -y / (1 + exp(y·pred))` with
//! `y ∈ {-1, +1}`, scaled by the row's sample weight.

pub mod ffm;
pub mod fm;
pub mod logit;
pub mod metric;
pub mod spmv;

use thiserror::Error;

use widefm_core::SArray;
use widefm_data::RowBlock;

pub use ffm::FfmLoss;
pub use fm::FmLoss;
pub use logit::LogitLoss;
pub use metric::BinClassMetric;

/// Errors from loss construction.
#[derive(Debug, Error)]
pub enum LossError {
    /// The requested loss name has no implementation.
    #[error("unknown loss type `{0}`")]
    UnknownLoss(String),
}

/// Positions of each packed column inside the pulled weight vector.
#[derive(Debug, Clone, Default)]
pub struct Pos {
    /// Start of the column's entry (its linear coordinate), or -1.
    pub w_pos: SArray<i32>,
    /// Start of the column's embedding coordinates, or -1.
    pub v_pos: SArray<i32>,
}

/// Builds column positions from pulled per-key lengths.
///
/// With empty `lens` every key has exactly one coordinate and positions are
/// the identity. Otherwise `w_pos[i]` is the entry start (or -1 when the
/// entry is empty) and `v_pos[i]` points past the linear coordinate when
/// the entry has more than one value.
pub fn build_pos(lens: &[i32]) -> Pos {
    if lens.is_empty() {
        return Pos::default();
    }
    let mut w_pos = Vec::with_capacity(lens.len());
    let mut v_pos = Vec::with_capacity(lens.len());
    let mut p = 0i32;
    for &l in lens {
        w_pos.push(if l == 0 { -1 } else { p });
        v_pos.push(if l > 1 { p + 1 } else { -1 });
        p += l;
    }
    Pos {
        w_pos: w_pos.into(),
        v_pos: v_pos.into(),
    }
}

/// Looks a packed column up in a position map; `None` means skip.
#[inline]
pub(crate) fn lookup(pos: &SArray<i32>, col: usize) -> Option<usize> {
    if pos.is_empty() {
        Some(col)
    } else {
        let p = pos[col];
        (p >= 0).then_some(p as usize)
    }
}

/// Prediction and gradient over a localized row block.
pub trait Loss: Send + Sync {
    /// Accumulates predictions for every row into `pred`.
    fn predict(&self, data: &RowBlock<u32>, weights: &SArray<f32>, pos: &Pos, pred: &mut [f32]);

    /// Accumulates gradients w.r.t. the packed weight vector into `grad`.
    fn calc_grad(
        &self,
        data: &RowBlock<u32>,
        weights: &SArray<f32>,
        pos: &Pos,
        pred: &[f32],
        grad: &mut [f32],
    );

    /// The training objective of a batch: the summed logistic loss.
    fn evaluate(&self, label: &[f32], pred: &[f32]) -> f64 {
        metric::logit_objv(label, pred)
    }
}

/// Creates a loss by name.
pub fn create_loss(name: &str, v_dim: usize, field_num: usize) -> Result<Box<dyn Loss>, LossError> {
    match name {
        "logit" => Ok(Box::new(LogitLoss::new())),
        "fm" => Ok(Box::new(FmLoss::new(v_dim))),
        "ffm" => Ok(Box::new(FfmLoss::new(v_dim, field_num))),
        other => Err(LossError::UnknownLoss(other.to_string())),
    }
}

/// The shared logistic link: `-y·w / (1 + exp(y·pred))` per row.
pub(crate) fn logistic_grad(data: &RowBlock<u32>, pred: &[f32]) -> Vec<f32> {
    let label = data
        .label
        .as_ref()
        .expect("labeled data required for gradients");
    pred.iter()
        .enumerate()
        .map(|(i, &p)| {
            let y = if label[i] > 0.0 { 1.0f32 } else { -1.0 };
            let g = -y / (1.0 + (y * p).exp());
            g * data.row_weight(i)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pos_identity_on_empty() {
        let pos = build_pos(&[]);
        assert!(pos.w_pos.is_empty());
        assert_eq!(lookup(&pos.w_pos, 5), Some(5));
    }

    #[test]
    fn test_build_pos_skips_empty_entries() {
        let pos = build_pos(&[3, 0, 1, 3]);
        assert_eq!(&*pos.w_pos, &[0, -1, 3, 4]);
        assert_eq!(&*pos.v_pos, &[1, -1, -1, 5]);
        assert_eq!(lookup(&pos.w_pos, 1), None);
        assert_eq!(lookup(&pos.w_pos, 3), Some(4));
    }

    #[test]
    fn test_create_loss_by_name() {
        assert!(create_loss("logit", 0, 0).is_ok());
        assert!(create_loss("fm", 4, 1).is_ok());
        assert!(create_loss("ffm", 4, 3).is_ok());
        assert!(matches!(
            create_loss("hinge", 0, 0),
            Err(LossError::UnknownLoss(_))
        ));
    }
}
