//! The L-BFGS updater (linear models).
//!
//! Each server shard keeps its slice of the weight and gradient vectors
//! plus a ring buffer of the last `m` `(s, y)` pairs, where `s` is the
//! weight step and `y` the gradient step of one accepted iteration. The
//! scheduler drives four phases per epoch:
//!
//! 1. Workers push their gradients; the shard accumulates them.
//! 2. `prepare_calc_direction` records the new `(s, y)` pair and returns
//!    the shard-local inner products `SᵀY, SᵀS, YᵀY, Sᵀg, Yᵀg` plus the
//!    newest pair's `sᵀy` and `yᵀy`. Summed over shards these are the
//!    global Gram matrices the scheduler factorizes.
//! 3. `calc_direction` receives the combination coefficients `[γ, a, b]`
//!    and materializes the shard's slice of `p = −(γ·g + S·a + γ·Y·b)`,
//!    returning the local `⟨p, g⟩`.
//! 4. `line_search(α)` moves `w` to `w₀ + α·p`, applied as a delta from
//!    the previously tried α.
//!
//! While a direction exists, pulls of `Weight` return `p` so workers can
//! track `w` incrementally; before the first direction they return `w`.

use std::collections::VecDeque;
use std::io::{Read, Write};

use parking_lot::Mutex;
use tracing::info;

use widefm_core::feaid::reverse_bytes;
use widefm_core::{FeaId, KwArgs, Progress, SArray};
use widefm_store::updater::Result;
use widefm_store::{Updater, UpdaterError, ValueKind};

use crate::kv::{kv_match, merge_counts, remove_tail_features, AssignOp};

/// Configuration of the L-BFGS updater.
#[derive(Debug, Clone)]
pub struct LbfgsUpdaterParam {
    /// Number of `(s, y)` pairs kept.
    pub m: usize,
    /// Features appearing at most this often are dropped.
    pub tail_feature_filter: i32,
}

impl LbfgsUpdaterParam {
    /// Consumes the updater keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        Ok(Self {
            m: kwargs.take_or("m", 10usize)?,
            tail_feature_filter: kwargs.take_or("tail_feature_filter", 0)?,
        })
    }
}

#[derive(Debug, Default)]
struct LbfgsState {
    feaids: Vec<FeaId>,
    feacnt: Vec<f32>,
    w: Vec<f32>,
    grad: Vec<f32>,
    grad_fresh: bool,
    prev_w: Vec<f32>,
    prev_grad: Vec<f32>,
    has_prev: bool,
    s_hist: VecDeque<Vec<f32>>,
    y_hist: VecDeque<Vec<f32>>,
    p: Vec<f32>,
    has_dir: bool,
    alpha_applied: f32,
    inited: bool,
}

/// The L-BFGS updater.
pub struct LbfgsUpdater {
    param: LbfgsUpdaterParam,
    state: Mutex<LbfgsState>,
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
}

impl LbfgsUpdater {
    /// Creates the updater.
    pub fn new(param: LbfgsUpdaterParam) -> Self {
        Self {
            param,
            state: Mutex::new(LbfgsState::default()),
        }
    }

    /// Freezes the kept key set; returns this shard's parameter count.
    pub fn init_weight(&self) -> usize {
        let mut state = self.state.lock();
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
        let n = state.feaids.len();
        state.w = vec![0.0; n];
        state.grad = vec![0.0; n];
        state.inited = true;
        n
    }

    /// Records the latest `(s, y)` pair and returns local inner products.
    ///
    /// Layout: `[SᵀY(t²) | SᵀS(t²) | YᵀY(t²) | Sᵀg(t) | Yᵀg(t) | sᵀy, yᵀy]`
    /// with `t` the current ring size; matrices are row-major with row `i`
    /// the `i`-th oldest pair.
    pub fn prepare_calc_direction(&self) -> Vec<f32> {
        let mut state = self.state.lock();
        if state.has_prev {
            let s: Vec<f32> = state
                .w
                .iter()
                .zip(state.prev_w.iter())
                .map(|(&a, &b)| a - b)
                .collect();
            let y: Vec<f32> = state
                .grad
                .iter()
                .zip(state.prev_grad.iter())
                .map(|(&a, &b)| a - b)
                .collect();
            state.s_hist.push_back(s);
            state.y_hist.push_back(y);
            if state.s_hist.len() > self.param.m {
                state.s_hist.pop_front();
                state.y_hist.pop_front();
            }
        }
        state.prev_w = state.w.clone();
        state.prev_grad = state.grad.clone();
        state.has_prev = true;
        state.grad_fresh = false;

        let t = state.s_hist.len();
        let mut out = Vec::with_capacity(3 * t * t + 2 * t + 2);
        for i in 0..t {
            for j in 0..t {
                out.push(dot(&state.s_hist[i], &state.y_hist[j]) as f32);
            }
        }
        for i in 0..t {
            for j in 0..t {
                out.push(dot(&state.s_hist[i], &state.s_hist[j]) as f32);
            }
        }
        for i in 0..t {
            for j in 0..t {
                out.push(dot(&state.y_hist[i], &state.y_hist[j]) as f32);
            }
        }
        for i in 0..t {
            out.push(dot(&state.s_hist[i], &state.grad) as f32);
        }
        for i in 0..t {
            out.push(dot(&state.y_hist[i], &state.grad) as f32);
        }
        if t > 0 {
            out.push(dot(&state.s_hist[t - 1], &state.y_hist[t - 1]) as f32);
            out.push(dot(&state.y_hist[t - 1], &state.y_hist[t - 1]) as f32);
        } else {
            out.push(0.0);
            out.push(0.0);
        }
        out
    }

    /// Materializes `p = −(γ·g + S·a + γ·Y·b)`; returns local `⟨p, g⟩`.
    ///
    /// `coeffs` is `[γ, a₀..a_{t-1}, b₀..b_{t-1}]`.
    pub fn calc_direction(&self, coeffs: &[f32]) -> f64 {
        let mut state = self.state.lock();
        let t = state.s_hist.len();
        debug_assert_eq!(coeffs.len(), 1 + 2 * t);
        let gamma = coeffs[0];
        let a = &coeffs[1..1 + t];
        let b = &coeffs[1 + t..1 + 2 * t];

        let mut p: Vec<f32> = state.grad.iter().map(|&g| -gamma * g).collect();
        for i in 0..t {
            let (si, yi) = (&state.s_hist[i], &state.y_hist[i]);
            for (j, pj) in p.iter_mut().enumerate() {
                *pj -= a[i] * si[j] + gamma * b[i] * yi[j];
            }
        }
        let pg = dot(&p, &state.grad);
        state.p = p;
        state.has_dir = true;
        state.alpha_applied = 0.0;
        pg
    }

    /// Moves the shard's weights to `w₀ + α·p`.
    pub fn line_search(&self, alpha: f32) {
        let mut state = self.state.lock();
        let step = alpha - state.alpha_applied;
        let p = std::mem::take(&mut state.p);
        for (w, &pj) in state.w.iter_mut().zip(p.iter()) {
            *w += step * pj;
        }
        state.p = p;
        state.alpha_applied = alpha;
    }
}

impl Updater for LbfgsUpdater {
    fn get(&self, keys: &SArray<FeaId>, kind: ValueKind) -> Result<(SArray<f32>, SArray<i32>)> {
        let state = self.state.lock();
        match kind {
            ValueKind::FeaCount => {
                let mut vals = Vec::new();
                kv_match(&state.feaids, &state.feacnt, keys, &mut vals, AssignOp::Assign);
                Ok((vals.into(), Default::default()))
            }
            ValueKind::Weight => {
                let src = if state.has_dir { &state.p } else { &state.w };
                let mut vals = Vec::new();
                kv_match(&state.feaids, src, keys, &mut vals, AssignOp::Assign);
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
                    return Err(UpdaterError::DimMismatch(
                        "gradient before init".into(),
                    ));
                }
                if !state.grad_fresh {
                    state.grad.fill(0.0);
                    state.grad_fresh = true;
                }
                for (i, &k) in keys.iter().enumerate() {
                    let idx = state
                        .feaids
                        .binary_search(&k)
                        .map_err(|_| UpdaterError::NotMaterialized(k))?;
                    state.grad[idx] += values[i];
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
        state.w = weights;
        state.grad = vec![0.0; n];
        state.inited = true;
        info!("loaded {} kv pairs", n);
        Ok(n as u64)
    }

    fn save(&self, _save_aux: bool, writer: &mut dyn Write) -> Result<u64> {
        writer.write_all(&[0u8])?;
        let state = self.state.lock();
        let mut saved = 0u64;
        for (i, &k) in state.feaids.iter().enumerate() {
            let w = *state.w.get(i).unwrap_or(&0.0);
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
            let w = *state.w.get(i).unwrap_or(&0.0);
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
        prog.nnz_w += state.w.iter().filter(|&&w| w != 0.0).count() as f64;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
