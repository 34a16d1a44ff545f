//! Binary-classification metrics.
//!
//! None of the metrics divide by the example count: batches merge by
//! addition and the epoch total is normalized once at the end. AUC in
//! particular is the area multiplied by the batch size, with the symmetric
//! fold `area < 0.5 => 1 - area` applied first.

/// Metrics over one batch of labels and raw predictions.
pub struct BinClassMetric<'a> {
    label: &'a [f32],
    predict: &'a [f32],
}

impl<'a> BinClassMetric<'a> {
    /// Wraps aligned label and prediction slices.
    pub fn new(label: &'a [f32], predict: &'a [f32]) -> Self {
        debug_assert_eq!(label.len(), predict.len());
        Self { label, predict }
    }

    /// Unnormalized AUC: `area * n`, folded to the informative side.
    ///
    /// Returns 1 for a single-class batch.
    pub fn auc(&self) -> f64 {
        let n = self.label.len();
        let mut buff: Vec<(f32, f32)> = self
            .predict
            .iter()
            .zip(self.label.iter())
            .map(|(&p, &y)| (p, y))
            .collect();
        buff.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut area = 0.0f64;
        let mut cum_tp = 0.0f64;
        for &(_, y) in &buff {
            if y > 0.0 {
                cum_tp += 1.0;
            } else {
                area += cum_tp;
            }
        }
        if cum_tp == 0.0 || cum_tp == n as f64 {
            return 1.0;
        }
        area /= cum_tp * (n as f64 - cum_tp);
        let folded = if area < 0.5 { 1.0 - area } else { area };
        folded * n as f64
    }

    /// Number of correct sign decisions at `threshold`, folded.
    pub fn accuracy(&self, threshold: f32) -> f64 {
        let n = self.label.len() as f64;
        let correct = self
            .label
            .iter()
            .zip(self.predict.iter())
            .filter(|&(&y, &p)| (y > 0.0 && p > threshold) || (y <= 0.0 && p <= threshold))
            .count() as f64;
        if correct > 0.5 * n {
            correct
        } else {
            n - correct
        }
    }

    /// Summed negative log-likelihood over probabilities `1/(1+e^-pred)`.
    pub fn logloss(&self) -> f64 {
        let mut loss = 0.0f64;
        for (&y, &p) in self.label.iter().zip(self.predict.iter()) {
            let y = if y > 0.0 { 1.0f64 } else { 0.0 };
            let prob = (1.0 / (1.0 + (-p as f64).exp())).max(1e-10);
            loss += y * prob.ln() + (1.0 - y) * (1.0 - prob).max(1e-10).ln();
        }
        -loss
    }
}

/// Summed logistic objective `Σ log(1 + exp(-y·pred))`.
pub fn logit_objv(label: &[f32], predict: &[f32]) -> f64 {
    label
        .iter()
        .zip(predict.iter())
        .map(|(&y, &p)| {
            let y = if y > 0.0 { 1.0f64 } else { -1.0 };
            (1.0 + (-y * p as f64).exp()).ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// O(n²) pair-counting reference for the folded, unnormalized AUC.
    fn auc_reference(label: &[f32], predict: &[f32]) -> f64 {
        let n = label.len();
        let (mut concordant, mut npos, mut nneg) = (0.0f64, 0.0f64, 0.0f64);
        for i in 0..n {
            if label[i] > 0.0 {
                npos += 1.0;
            } else {
                nneg += 1.0;
            }
        }
        if npos == 0.0 || nneg == 0.0 {
            return 1.0;
        }
        // Count positive-over-negative orderings after an ascending sort,
        // mirroring the cumulative implementation exactly (ties resolved by
        // sort position).
        let mut buff: Vec<(f32, f32)> = predict.iter().copied().zip(label.iter().copied()).collect();
        buff.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for i in 0..n {
            if buff[i].1 <= 0.0 {
                for item in buff.iter().take(i) {
                    if item.1 > 0.0 {
                        concordant += 1.0;
                    }
                }
            }
        }
        let area = concordant / (npos * nneg);
        (if area < 0.5 { 1.0 - area } else { area }) * n as f64
    }

    #[test]
    fn test_auc_perfectly_separated() {
        // All positives scored above all negatives: folded area 1, times n.
        let label = [-1.0, -1.0, 1.0, 1.0, 1.0];
        let predict = [0.1, 0.2, 0.7, 0.8, 0.9];
        assert_eq!(BinClassMetric::new(&label, &predict).auc(), 5.0);
    }

    #[test]
    fn test_auc_perfectly_inverted_folds() {
        let label = [1.0, 1.0, -1.0, -1.0];
        let predict = [0.1, 0.2, 0.8, 0.9];
        assert_eq!(BinClassMetric::new(&label, &predict).auc(), 4.0);
    }

    #[test]
    fn test_auc_single_class_is_one() {
        let label = [1.0, 1.0];
        let predict = [0.3, 0.4];
        assert_eq!(BinClassMetric::new(&label, &predict).auc(), 1.0);
    }

    #[test]
    fn test_auc_matches_pair_counting_reference() {
        let mut rng = StdRng::seed_from_u64(17);
        for n in [2usize, 3, 10, 100, 1000] {
            let label: Vec<f32> = (0..n)
                .map(|_| if rng.gen_bool(0.4) { 1.0 } else { -1.0 })
                .collect();
            let predict: Vec<f32> = (0..n).map(|_| rng.gen_range(-3.0..3.0)).collect();
            let got = BinClassMetric::new(&label, &predict).auc();
            let want = auc_reference(&label, &predict);
            assert!(
                (got - want).abs() < 1e-9,
                "n = {}: {} vs {}",
                n,
                got,
                want
            );
        }
    }

    #[test]
    fn test_accuracy_folds() {
        let label = [1.0, -1.0, 1.0, -1.0];
        let predict = [1.0, -1.0, -1.0, 1.0];
        // Two correct out of four folds to two.
        assert_eq!(BinClassMetric::new(&label, &predict).accuracy(0.0), 2.0);
    }

    #[test]
    fn test_logit_objv_at_zero() {
        let label = [1.0, -1.0];
        let predict = [0.0, 0.0];
        assert!((logit_objv(&label, &predict) - 2.0 * (2.0f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_logloss_guards_extremes() {
        let label = [1.0];
        let predict = [-100.0];
        assert!(BinClassMetric::new(&label, &predict).logloss().is_finite());
    }
}
