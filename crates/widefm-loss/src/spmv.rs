//! Sparse matrix-vector micro-kernels with position maps.
//!
//! Both kernels take an optional map from packed column to position in the
//! weight (or gradient) vector; an empty map is the identity and `-1`
//! skips the column. `times` parallelizes over row chunks since rows write
//! disjoint outputs; the transpose accumulates into shared columns and
//! stays sequential, callers parallelize across blocks with per-thread
//! buffers.

use rayon::prelude::*;

use widefm_core::SArray;
use widefm_data::RowBlock;

use crate::lookup;

/// Rows below this size are not worth fanning out to rayon.
const PAR_ROWS: usize = 1024;

/// `pred[i] += Σ_j w[pos[index[j]]] · value[j]` over row `i`'s nonzeros.
pub fn times(data: &RowBlock<u32>, w: &SArray<f32>, pos: &SArray<i32>, pred: &mut [f32]) {
    debug_assert_eq!(pred.len(), data.size());
    let row = |i: usize, out: &mut f32| {
        let mut acc = 0.0f32;
        for j in data.offset[i]..data.offset[i + 1] {
            let Some(p) = lookup(pos, data.index[j] as usize) else {
                continue;
            };
            let v = data.value.as_ref().map_or(1.0, |a| a[j]);
            acc += w[p] * v;
        }
        *out += acc;
    };
    if data.size() >= PAR_ROWS {
        pred.par_iter_mut()
            .enumerate()
            .for_each(|(i, out)| row(i, out));
    } else {
        for (i, out) in pred.iter_mut().enumerate() {
            row(i, out);
        }
    }
}

/// `grad[pos[index[j]]] += p[i] · value[j]` over every nonzero.
pub fn trans_times(data: &RowBlock<u32>, p: &[f32], pos: &SArray<i32>, grad: &mut [f32]) {
    debug_assert_eq!(p.len(), data.size());
    for i in 0..data.size() {
        let pi = p[i];
        if pi == 0.0 {
            continue;
        }
        for j in data.offset[i]..data.offset[i + 1] {
            let Some(q) = lookup(pos, data.index[j] as usize) else {
                continue;
            };
            let v = data.value.as_ref().map_or(1.0, |a| a[j]);
            grad[q] += pi * v;
        }
    }
}
