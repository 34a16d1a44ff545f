//! Field-aware factorization machine.
//!
//! Every feature `i` carries one `v_dim`-sized embedding per field, laid
//! out contiguously; the interaction of features `i` and `j` uses `i`'s
//! embedding for `j`'s field and vice versa:
//!
//! ```text
//! pred = Σ_{i<j} ⟨V_{i,fⱼ}, V_{j,fᵢ}⟩ · xᵢ · xⱼ
//! ```
//!
//! Entries start at `w_pos`; the slice for field `f` begins `f·v_dim`
//! coordinates in. Predictions are clipped to ±20 so the logistic
//! transform cannot overflow.

use rayon::prelude::*;

use widefm_core::SArray;
use widefm_data::RowBlock;

use crate::{logistic_grad, lookup, Loss, Pos};

const PRED_CLIP: f32 = 20.0;
const PAR_ROWS: usize = 512;

/// The field-aware FM loss.
#[derive(Debug)]
pub struct FfmLoss {
    v_dim: usize,
    field_num: usize,
}

impl FfmLoss {
    /// Creates an FFM loss with `v_dim` coordinates per field slice.
    pub fn new(v_dim: usize, field_num: usize) -> Self {
        Self { v_dim, field_num }
    }

    #[inline]
    fn field(&self, data: &RowBlock<u32>, j: usize) -> usize {
        let f = data.field.as_ref().map_or(0, |a| a[j] as usize);
        f.min(self.field_num.saturating_sub(1))
    }

    fn predict_row(&self, data: &RowBlock<u32>, weights: &SArray<f32>, pos: &Pos, i: usize) -> f32 {
        let mut pred = 0.0f32;
        for j1 in data.offset[i]..data.offset[i + 1] {
            let Some(p1) = lookup(&pos.w_pos, data.index[j1] as usize) else {
                continue;
            };
            let f1 = self.field(data, j1);
            let x1 = data.value.as_ref().map_or(1.0, |a| a[j1]);
            for j2 in j1 + 1..data.offset[i + 1] {
                let Some(p2) = lookup(&pos.w_pos, data.index[j2] as usize) else {
                    continue;
                };
                let f2 = self.field(data, j2);
                let x2 = data.value.as_ref().map_or(1.0, |a| a[j2]);
                let v1 = p1 + f2 * self.v_dim;
                let v2 = p2 + f1 * self.v_dim;
                let mut dot = 0.0f32;
                for k in 0..self.v_dim {
                    dot += weights[v1 + k] * weights[v2 + k];
                }
                pred += dot * x1 * x2;
            }
        }
        pred.clamp(-PRED_CLIP, PRED_CLIP)
    }
}

impl Loss for FfmLoss {
    fn predict(&self, data: &RowBlock<u32>, weights: &SArray<f32>, pos: &Pos, pred: &mut [f32]) {
        if data.size() >= PAR_ROWS {
            pred.par_iter_mut()
                .enumerate()
                .for_each(|(i, out)| *out += self.predict_row(data, weights, pos, i));
        } else {
            for (i, out) in pred.iter_mut().enumerate() {
                *out += self.predict_row(data, weights, pos, i);
            }
        }
    }

    fn calc_grad(
        &self,
        data: &RowBlock<u32>,
        weights: &SArray<f32>,
        pos: &Pos,
        pred: &[f32],
        grad: &mut [f32],
    ) {
        let p = logistic_grad(data, pred);
        for i in 0..data.size() {
            if p[i] == 0.0 {
                continue;
            }
            for j1 in data.offset[i]..data.offset[i + 1] {
                let Some(p1) = lookup(&pos.w_pos, data.index[j1] as usize) else {
                    continue;
                };
                let f1 = self.field(data, j1);
                let x1 = data.value.as_ref().map_or(1.0, |a| a[j1]);
                for j2 in j1 + 1..data.offset[i + 1] {
                    let Some(p2) = lookup(&pos.w_pos, data.index[j2] as usize) else {
                        continue;
                    };
                    let f2 = self.field(data, j2);
                    let x2 = data.value.as_ref().map_or(1.0, |a| a[j2]);
                    let v1 = p1 + f2 * self.v_dim;
                    let v2 = p2 + f1 * self.v_dim;
                    let scale = p[i] * x1 * x2;
                    for k in 0..self.v_dim {
                        grad[v1 + k] += weights[v2 + k] * scale;
                        grad[v2 + k] += weights[v1 + k] * scale;
                    }
                }
            }
        }
    }
}
