//! Sparse logistic regression.
//!
//! `pred = X·w`, `∂ℓ/∂pred = -y / (1 + exp(y·pred))`, `grad = Xᵀ·∂ℓ/∂pred`.
//! Only the leading coordinate of each entry participates; embedding
//! coordinates, if present, pass through untouched.

use widefm_core::SArray;
use widefm_data::RowBlock;

use crate::{logistic_grad, spmv, Loss, Pos};

/// The logistic loss.
#[derive(Debug, Default)]
pub struct LogitLoss;

impl LogitLoss {
    /// Creates the loss.
    pub fn new() -> Self {
        Self
    }
}

impl Loss for LogitLoss {
    fn predict(&self, data: &RowBlock<u32>, weights: &SArray<f32>, pos: &Pos, pred: &mut [f32]) {
        spmv::times(data, weights, &pos.w_pos, pred);
    }

    fn calc_grad(
        &self,
        data: &RowBlock<u32>,
        _weights: &SArray<f32>,
        pos: &Pos,
        pred: &[f32],
        grad: &mut [f32],
    ) {
        let p = logistic_grad(data, pred);
        spmv::trans_times(data, &p, &pos.w_pos, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_pos;
    use widefm_data::rowblock::RowBlockBuilder;

    fn block() -> RowBlock<u32> {
        let mut b = RowBlockBuilder::<u32>::new();
        b.push_row(1.0, 1.0, &[(0, 0, 1.0), (0, 1, 1.0)]);
        b.push_row(-1.0, 1.0, &[(0, 1, 1.0)]);
        b.finish()
    }

    #[test]
    fn test_predict_is_xw() {
        let loss = LogitLoss::new();
        let w: SArray<f32> = vec![0.5, -0.25].into();
        let mut pred = vec![0.0; 2];
        loss.predict(&block(), &w, &Pos::default(), &mut pred);
        assert_eq!(pred, vec![0.25, -0.25]);
    }

    #[test]
    fn test_grad_at_zero_weights() {
        // pred = 0 => ∂ℓ/∂pred = -y/2.
        let loss = LogitLoss::new();
        let w: SArray<f32> = vec![0.0, 0.0].into();
        let pos = build_pos(&[1, 1]);
        let mut pred = vec![0.0; 2];
        let data = block();
        loss.predict(&data, &w, &pos, &mut pred);
        let mut grad = vec![0.0; 2];
        loss.calc_grad(&data, &w, &pos, &pred, &mut grad);
        assert_eq!(grad, vec![-0.5, 0.0]); // col 1: -0.5 + 0.5
    }

    #[test]
    fn test_grad_descends_objective() {
        let loss = LogitLoss::new();
        let data = block();
        let pos = build_pos(&[1, 1]);
        let w: SArray<f32> = vec![0.1, -0.2].into();
        let mut pred = vec![0.0; 2];
        loss.predict(&data, &w, &pos, &mut pred);
        let before = loss.evaluate(&[1.0, -1.0], &pred);

        let mut grad = vec![0.0; 2];
        loss.calc_grad(&data, &w, &pos, &pred, &mut grad);
        let stepped: SArray<f32> = w.iter().zip(&grad).map(|(w, g)| w - 0.1 * g).collect();
        let mut pred2 = vec![0.0; 2];
        loss.predict(&data, &stepped, &pos, &mut pred2);
        let after = loss.evaluate(&[1.0, -1.0], &pred2);
        assert!(after < before);
    }

    #[test]
    fn test_sample_weight_scales_grad() {
        let mut b = RowBlockBuilder::<u32>::new();
        b.push_row(1.0, 3.0, &[(0, 0, 1.0)]);
        let data = b.finish();
        let loss = LogitLoss::new();
        let mut grad = vec![0.0; 1];
        loss.calc_grad(&data, &vec![0.0].into(), &Pos::default(), &[0.0], &mut grad);
        assert_eq!(grad, vec![-1.5]); // -y/2 times weight 3
    }
}
