//! The block-coordinate-descent updater (linear models).
//!
//! Workers push, per kept feature, a gradient `g` and a curvature `h`; the
//! server solves the one-dimensional proximal L1 problem
//!
//! ```text
//! g⁺ = g + λ₁,  g⁻ = g − λ₁,  u = h/η + ε
//! d  = −g⁺/u  if g⁺ ≤ u·w
//! d  = −g⁻/u  if g⁻ ≥ u·w
//! d  = −w     otherwise
//! ```
//!
//! clips `d` to the per-feature step bound `δ`, grows the bound with the
//! step (`δ = 2|d| + 0.1`), and applies `w += d`. A pull of `Weight`
//! returns the last applied deltas so workers refresh their cached
//! predictions incrementally.
//!
//! The kept key set is frozen the first time weights are touched: features
//! whose accumulated count is at most `tail_feature_filter` are dropped and
//! never weighted afterwards.

use std::io::{Read, Write};

use parking_lot::Mutex;
use tracing::info;

use widefm_core::feaid::reverse_bytes;
use widefm_core::{FeaId, KwArgs, Progress, SArray};
use widefm_store::updater::Result;
use widefm_store::{Updater, UpdaterError, ValueKind};

use crate::kv::{kv_match, merge_counts, remove_tail_features, AssignOp};

/// Configuration of the BCD updater.
#[derive(Debug, Clone)]
pub struct BcdUpdaterParam {
    /// The L1 regularizer λ₁.
    pub l1: f32,
    /// The learning rate η dividing the curvature.
    pub lr: f32,
    /// Features appearing at most this often are dropped.
    pub tail_feature_filter: i32,
}

impl BcdUpdaterParam {
    /// Consumes the updater keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        Ok(Self {
            l1: kwargs.take_or("l1", 1.0)?,
            lr: kwargs.take_or("lr", 0.9)?,
            tail_feature_filter: kwargs.take_or("tail_feature_filter", 4)?,
        })
    }
}

#[derive(Debug, Default)]
struct BcdState {
    feaids: Vec<FeaId>,
    feacnt: Vec<f32>,
    weights: Vec<f32>,
    w_delta: Vec<f32>,
    delta: Vec<f32>,
    inited: bool,
}

/// The BCD updater.
pub struct BcdUpdater {
    param: BcdUpdaterParam,
    state: Mutex<BcdState>,
}

impl BcdUpdater {
    /// Creates the updater.
    pub fn new(param: BcdUpdaterParam) -> Self {
        Self {
            param,
            state: Mutex::new(BcdState::default()),
        }
    }

    /// The configured parameters.
    pub fn param(&self) -> &BcdUpdaterParam {
        &self.param
    }

    fn init_weights(&self, state: &mut BcdState) {
        let kept = remove_tail_features(
            &state.feaids,
            &state.feacnt,
            self.param.tail_feature_filter,
        );
        info!(
            total = state.feaids.len(),
            kept = kept.len(),
            "froze feature set"
        );
        state.feaids = kept;
        state.feacnt.clear();
        state.weights = vec![0.0; state.feaids.len()];
        state.w_delta = vec![0.0; state.feaids.len()];
        state.delta = vec![1.0; state.feaids.len()];
        state.inited = true;
    }

    fn update_weight(&self, state: &mut BcdState, idx: usize, g: f32, h: f32) {
        let g_pos = g + self.param.l1;
        let g_neg = g - self.param.l1;
        let u = h / self.param.lr + 1e-10;
        let w = state.weights[idx];
        let mut d = -w;
        if g_pos <= u * w {
            d = -g_pos / u;
        } else if g_neg >= u * w {
            d = -g_neg / u;
        }
        d = d.clamp(-state.delta[idx], state.delta[idx]);
        state.delta[idx] = 2.0 * d.abs() + 0.1;
        state.weights[idx] += d;
        state.w_delta[idx] = d;
    }
}

impl Updater for BcdUpdater {
    fn get(&self, keys: &SArray<FeaId>, kind: ValueKind) -> Result<(SArray<f32>, SArray<i32>)> {
        let mut state = self.state.lock();
        match kind {
            ValueKind::FeaCount => {
                let mut vals = Vec::new();
                kv_match(&state.feaids, &state.feacnt, keys, &mut vals, AssignOp::Assign);
                Ok((vals.into(), Default::default()))
            }
            ValueKind::Weight => {
                if !state.inited {
                    self.init_weights(&mut state);
                }
                let mut vals = Vec::new();
                kv_match(
                    &state.feaids,
                    &state.w_delta,
                    keys,
                    &mut vals,
                    AssignOp::Assign,
                );
                Ok((vals.into(), Default::default()))
            }
            ValueKind::Gradient => Err(UpdaterError::KindMismatch { kind }),
        }
    }

    fn update(
        &self,
        keys: &SArray<FeaId>,
        kind: ValueKind,
        values: &SArray<f32>,
        _lens: &SArray<i32>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match kind {
            ValueKind::FeaCount => {
                let (feaids, feacnt) =
                    merge_counts(&state.feaids, &state.feacnt, keys, values);
                state.feaids = feaids;
                state.feacnt = feacnt;
                Ok(())
            }
            ValueKind::Gradient => {
                if !state.inited {
                    self.init_weights(&mut state);
                }
                if values.len() != keys.len() * 2 {
                    return Err(UpdaterError::DimMismatch(format!(
                        "{} values for {} keys of (g, h) pairs",
                        values.len(),
                        keys.len()
                    )));
                }
                for (i, &k) in keys.iter().enumerate() {
                    let idx = state
                        .feaids
                        .binary_search(&k)
                        .map_err(|_| UpdaterError::NotMaterialized(k))?;
                    self.update_weight(&mut state, idx, values[2 * i], values[2 * i + 1]);
                }
                Ok(())
            }
            ValueKind::Weight => Err(UpdaterError::KindMismatch { kind }),
        }
    }

    fn load(&self, reader: &mut dyn Read) -> Result<u64> {
        let mut flag = [0u8; 1];
        if reader.read_exact(&mut flag).is_err() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let mut feaids = Vec::new();
        let mut weights = Vec::new();
        loop {
            let mut key_buf = [0u8; 8];
            match reader.read_exact(&mut key_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut size_buf = [0u8; 4];
            reader.read_exact(&mut size_buf)?;
            if i32::from_le_bytes(size_buf) != 1 {
                return Err(UpdaterError::Corrupt("linear entries have size 1".into()));
            }
            let mut w_buf = [0u8; 4];
            reader.read_exact(&mut w_buf)?;
            feaids.push(FeaId::from_le_bytes(key_buf));
            weights.push(f32::from_le_bytes(w_buf));
        }
        let n = feaids.len();
        state.feaids = feaids;
        state.weights = weights;
        state.w_delta = vec![0.0; n];
        state.delta = vec![1.0; n];
        state.inited = true;
        info!("loaded {} kv pairs", n);
        Ok(n as u64)
    }

    fn save(&self, _save_aux: bool, writer: &mut dyn Write) -> Result<u64> {
        writer.write_all(&[0u8])?;
        let state = self.state.lock();
        let mut saved = 0u64;
        for (i, &k) in state.feaids.iter().enumerate() {
            let w = *state.weights.get(i).unwrap_or(&0.0);
            if w == 0.0 {
                continue;
            }
            writer.write_all(&k.to_le_bytes())?;
            writer.write_all(&1i32.to_le_bytes())?;
            writer.write_all(&w.to_le_bytes())?;
            saved += 1;
        }
        info!("saved {} kv pairs", saved);
        Ok(saved)
    }

    fn dump(&self, _dump_aux: bool, need_reverse: bool, writer: &mut dyn Write) -> Result<u64> {
        let state = self.state.lock();
        let mut dumped = 0u64;
        for (i, &k) in state.feaids.iter().enumerate() {
            let w = *state.weights.get(i).unwrap_or(&0.0);
            if w == 0.0 {
                continue;
            }
            let key = if need_reverse { reverse_bytes(k) } else { k };
            writeln!(writer, "{}\t1\t{}", key, w)?;
            dumped += 1;
        }
        Ok(dumped)
    }

    fn report(&self) -> Progress {
        Progress::default()
    }

    fn evaluate(&self, prog: &mut Progress) {
        let state = self.state.lock();
        for &w in &state.weights {
            if w != 0.0 {
                prog.nnz_w += 1.0;
                prog.penalty += (self.param.l1 * w.abs()) as f64;
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updater(l1: f32, filter: i32) -> BcdUpdater {
        BcdUpdater::new(BcdUpdaterParam {
            l1,
            lr: 1.0,
            tail_feature_filter: filter,
        })
    }

    fn push_counts(u: &BcdUpdater, keys: &[FeaId], counts: &[f32]) {
        u.update(
            &keys.to_vec().into(),
            ValueKind::FeaCount,
            &counts.to_vec().into(),
            &Default::default(),
        )
        .unwrap();
    }

    #[test]
    fn test_tail_filter_freezes_kept_set() {
        let u = updater(0.0, 4);
        push_counts(&u, &[1, 2, 3], &[10.0, 2.0, 5.0]);
        push_counts(&u, &[2], &[1.0]); // count 3, still at most 4
        // First weight access freezes the set.
        let (vals, _) = u.get(&vec![1, 2, 3].into(), ValueKind::Weight).unwrap();
        assert_eq!(vals.len(), 3);
        // Gradients for a filtered feature are a fault.
        let err = u
            .update(
                &vec![2].into(),
                ValueKind::Gradient,
                &vec![1.0, 1.0].into(),
                &Default::default(),
            )
            .unwrap_err();
        assert!(matches!(err, UpdaterError::NotMaterialized(2)));
    }

    #[test]
    fn test_proximal_step_without_l1() {
        // With λ₁ = 0 and η = 1: d = -g/h (Newton step), bounded by δ = 1.
        let u = updater(0.0, 0);
        push_counts(&u, &[5], &[1.0]);
        u.update(
            &vec![5].into(),
            ValueKind::Gradient,
            &vec![0.5, 1.0].into(),
            &Default::default(),
        )
        .unwrap();
        let (delta, _) = u.get(&vec![5].into(), ValueKind::Weight).unwrap();
        assert!((delta[0] + 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_l1_soft_threshold_keeps_zero() {
        // |g| <= λ₁ at w = 0: no move.
        let u = updater(1.0, 0);
        push_counts(&u, &[5], &[1.0]);
        u.update(
            &vec![5].into(),
            ValueKind::Gradient,
            &vec![0.5, 1.0].into(),
            &Default::default(),
        )
        .unwrap();
        let (delta, _) = u.get(&vec![5].into(), ValueKind::Weight).unwrap();
        assert_eq!(delta[0], 0.0);
    }

    #[test]
    fn test_step_bound_clips_and_grows() {
        let u = updater(0.0, 0);
        push_counts(&u, &[5], &[1.0]);
        // A huge step is clipped to the initial δ = 1.
        u.update(
            &vec![5].into(),
            ValueKind::Gradient,
            &vec![100.0, 1.0].into(),
            &Default::default(),
        )
        .unwrap();
        let (delta, _) = u.get(&vec![5].into(), ValueKind::Weight).unwrap();
        assert_eq!(delta[0], -1.0);
        // δ is now 2.1, so the next step may move further.
        u.update(
            &vec![5].into(),
            ValueKind::Gradient,
            &vec![100.0, 50.0].into(),
            &Default::default(),
        )
        .unwrap();
        let (delta, _) = u.get(&vec![5].into(), ValueKind::Weight).unwrap();
        assert!(delta[0] < -1.0 && delta[0] >= -2.1);
    }

    #[test]
    fn test_save_dump_linear_format() {
        let u = updater(0.0, 0);
        push_counts(&u, &[9], &[1.0]);
        u.update(
            &vec![9].into(),
            ValueKind::Gradient,
            &vec![0.5, 1.0].into(),
            &Default::default(),
        )
        .unwrap();
        let mut bytes = Vec::new();
        assert_eq!(u.save(false, &mut bytes).unwrap(), 1);

        let u2 = updater(0.0, 0);
        assert_eq!(u2.load(&mut bytes.as_slice()).unwrap(), 1);
        let mut dump = Vec::new();
        u2.dump(false, false, &mut dump).unwrap();
        let text = String::from_utf8(dump).unwrap();
        assert!(text.starts_with("9\t1\t-0.5"));
    }
}
