//! Factorization machine.
//!
//! Prediction per row:
//!
//! ```text
//! pred = ⟨w, x⟩ + ½ (‖Vx‖² − Σᵢ xᵢ² ‖Vᵢ‖²)
//! ```
//!
//! Each materialized entry is laid out `[w, V₀..V_{k-1}]`: the linear
//! coordinate at `w_pos`, the embedding at `v_pos`. The gradient w.r.t.
//! `Vᵢ,ₖ` is `p·xᵢ·((Vx)ₖ − xᵢVᵢ,ₖ)` where `p` is the logistic link.

use rayon::prelude::*;

use widefm_core::SArray;
use widefm_data::RowBlock;

use crate::{logistic_grad, lookup, Loss, Pos};

const PRED_CLIP: f32 = 20.0;
const PAR_ROWS: usize = 1024;

/// The factorization-machine loss.
#[derive(Debug)]
pub struct FmLoss {
    v_dim: usize,
}

impl FmLoss {
    /// Creates an FM loss with embedding dimension `v_dim`.
    pub fn new(v_dim: usize) -> Self {
        Self { v_dim }
    }

    fn predict_row(
        &self,
        data: &RowBlock<u32>,
        weights: &SArray<f32>,
        pos: &Pos,
        i: usize,
        s: &mut [f32],
    ) -> f32 {
        let mut pred = 0.0f32;
        let mut norm = 0.0f32;
        s.fill(0.0);
        for j in data.offset[i]..data.offset[i + 1] {
            let col = data.index[j] as usize;
            let x = data.value.as_ref().map_or(1.0, |a| a[j]);
            if let Some(w) = lookup(&pos.w_pos, col) {
                pred += weights[w] * x;
            }
            if let Some(v) = lookup(&pos.v_pos, col) {
                for k in 0..self.v_dim {
                    let vk = weights[v + k];
                    s[k] += x * vk;
                    norm += x * x * vk * vk;
                }
            }
        }
        for &sk in s.iter() {
            pred += 0.5 * sk * sk;
        }
        pred -= 0.5 * norm;
        pred.clamp(-PRED_CLIP, PRED_CLIP)
    }
}

impl Loss for FmLoss {
    fn predict(&self, data: &RowBlock<u32>, weights: &SArray<f32>, pos: &Pos, pred: &mut [f32]) {
        if data.size() >= PAR_ROWS {
            pred.par_iter_mut().enumerate().for_each(|(i, out)| {
                let mut s = vec![0.0f32; self.v_dim];
                *out += self.predict_row(data, weights, pos, i, &mut s);
            });
        } else {
            let mut s = vec![0.0f32; self.v_dim];
            for (i, out) in pred.iter_mut().enumerate() {
                *out += self.predict_row(data, weights, pos, i, &mut s);
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
        let mut s = vec![0.0f32; self.v_dim];
        for i in 0..data.size() {
            if p[i] == 0.0 {
                continue;
            }
            // Recompute Vx for the row, then distribute.
            s.fill(0.0);
            for j in data.offset[i]..data.offset[i + 1] {
                let col = data.index[j] as usize;
                let Some(v) = lookup(&pos.v_pos, col) else { continue };
                let x = data.value.as_ref().map_or(1.0, |a| a[j]);
                for k in 0..self.v_dim {
                    s[k] += x * weights[v + k];
                }
            }
            for j in data.offset[i]..data.offset[i + 1] {
                let col = data.index[j] as usize;
                let x = data.value.as_ref().map_or(1.0, |a| a[j]);
                if let Some(w) = lookup(&pos.w_pos, col) {
                    grad[w] += p[i] * x;
                }
                if let Some(v) = lookup(&pos.v_pos, col) {
                    for k in 0..self.v_dim {
                        grad[v + k] += p[i] * x * (s[k] - x * weights[v + k]);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_pos;
    use widefm_data::rowblock::RowBlockBuilder;

    /// Two features, dense entries [w, V0, V1] each.
    fn setup() -> (RowBlock<u32>, SArray<f32>, Pos) {
        let mut b = RowBlockBuilder::<u32>::new();
        b.push_row(1.0, 1.0, &[(0, 0, 1.0), (0, 1, 2.0)]);
        let data = b.finish();
        let weights: SArray<f32> =
            vec![0.5, 1.0, -1.0, /* key1 */ 0.25, 2.0, 1.0].into();
        let pos = build_pos(&[3, 3]);
        (data, weights, pos)
    }

    #[test]
    fn test_predict_matches_pairwise_form() {
        let (data, weights, pos) = setup();
        let loss = FmLoss::new(2);
        let mut pred = vec![0.0];
        loss.predict(&data, &weights, &pos, &mut pred);
        // Linear: 0.5*1 + 0.25*2 = 1.0
        // Pairwise: x0*x1*⟨V0,V1⟩ = 1*2*(1*2 + (-1)*1) = 2
        assert!((pred[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_predict_single_feature_has_no_interaction() {
        let mut b = RowBlockBuilder::<u32>::new();
        b.push_row(1.0, 1.0, &[(0, 0, 3.0)]);
        let data = b.finish();
        let weights: SArray<f32> = vec![0.5, 1.0, -1.0].into();
        let pos = build_pos(&[3]);
        let loss = FmLoss::new(2);
        let mut pred = vec![0.0];
        loss.predict(&data, &weights, &pos, &mut pred);
        assert!((pred[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_grad_matches_finite_difference() {
        let (data, weights, pos) = setup();
        let loss = FmLoss::new(2);
        let mut pred = vec![0.0];
        loss.predict(&data, &weights, &pos, &mut pred);
        let mut grad = vec![0.0; weights.len()];
        loss.calc_grad(&data, &weights, &pos, &pred, &mut grad);

        let eps = 1e-3f32;
        for c in 0..weights.len() {
            let mut wp = weights.to_vec();
            wp[c] += eps;
            let mut wm = weights.to_vec();
            wm[c] -= eps;
            let objv = |w: Vec<f32>| {
                let mut p = vec![0.0];
                loss.predict(&data, &w.into(), &pos, &mut p);
                loss.evaluate(&[1.0], &p)
            };
            let fd = (objv(wp) - objv(wm)) / (2.0 * eps as f64);
            assert!(
                (grad[c] as f64 - fd).abs() < 1e-2,
                "coordinate {}: grad {} vs fd {}",
                c,
                grad[c],
                fd
            );
        }
    }

    #[test]
    fn test_prediction_clipped() {
        let mut b = RowBlockBuilder::<u32>::new();
        b.push_row(1.0, 1.0, &[(0, 0, 100.0)]);
        let data = b.finish();
        let weights: SArray<f32> = vec![10.0, 0.0].into();
        let pos = build_pos(&[2]);
        let loss = FmLoss::new(1);
        let mut pred = vec![0.0];
        loss.predict(&data, &weights, &pos, &mut pred);
        assert_eq!(pred[0], 20.0);
    }
}
