//! Sorted key-value matching.
//!
//! Servers keep frozen sorted key lists; requests arrive as sorted subsets.
//! [`kv_match`] merges source values into destination slots by key,
//! touching matched destinations exactly once and leaving the rest alone.

use widefm_core::FeaId;

/// How a matched source value combines into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `dst = src`
    Assign,
    /// `dst += src`
    Plus,
}

/// Merges `src` values into `dst` values by matching sorted unique keys.
///
/// Values are fixed-length per key (`src_val.len() / src_key.len()`).
/// `dst_val` is resized to `dst_key.len()` entries of that length; existing
/// prefix values survive, new slots start at zero, and unmatched
/// destinations are untouched. Returns the number of matched keys.
pub fn kv_match<V: Copy + Default + std::ops::AddAssign>(
    src_key: &[FeaId],
    src_val: &[V],
    dst_key: &[FeaId],
    dst_val: &mut Vec<V>,
    op: AssignOp,
) -> usize {
    if src_key.is_empty() {
        dst_val.resize(dst_key.len(), V::default());
        return 0;
    }
    let val_len = src_val.len() / src_key.len();
    debug_assert_eq!(src_key.len() * val_len, src_val.len());
    dst_val.resize(dst_key.len() * val_len, V::default());

    let mut matched = 0;
    let (mut i, mut j) = (0usize, 0usize);
    while i < src_key.len() && j < dst_key.len() {
        if src_key[i] < dst_key[j] {
            i += 1;
        } else if src_key[i] > dst_key[j] {
            j += 1;
        } else {
            for k in 0..val_len {
                let v = src_val[i * val_len + k];
                match op {
                    AssignOp::Assign => dst_val[j * val_len + k] = v,
                    AssignOp::Plus => dst_val[j * val_len + k] += v,
                }
            }
            matched += 1;
            i += 1;
            j += 1;
        }
    }
    matched
}

/// Merges two sorted unique `(key, count)` lists, summing shared keys.
pub fn merge_counts(
    keys_a: &[FeaId],
    counts_a: &[f32],
    keys_b: &[FeaId],
    counts_b: &[f32],
) -> (Vec<FeaId>, Vec<f32>) {
    let mut keys = Vec::with_capacity(keys_a.len() + keys_b.len());
    let mut counts = Vec::with_capacity(keys.capacity());
    let (mut i, mut j) = (0, 0);
    while i < keys_a.len() || j < keys_b.len() {
        if j >= keys_b.len() || (i < keys_a.len() && keys_a[i] < keys_b[j]) {
            keys.push(keys_a[i]);
            counts.push(counts_a[i]);
            i += 1;
        } else if i >= keys_a.len() || keys_b[j] < keys_a[i] {
            keys.push(keys_b[j]);
            counts.push(counts_b[j]);
            j += 1;
        } else {
            keys.push(keys_a[i]);
            counts.push(counts_a[i] + counts_b[j]);
            i += 1;
            j += 1;
        }
    }
    (keys, counts)
}

/// Keeps the keys whose count exceeds `filter`.
pub fn remove_tail_features(keys: &[FeaId], counts: &[f32], filter: i32) -> Vec<FeaId> {
    keys.iter()
        .zip(counts.iter())
        .filter(|&(_, &c)| c > filter as f32)
        .map(|(&k, _)| k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_match_reference_example() {
        let mut dst = Vec::new();
        let n = kv_match(&[1, 2, 3], &[6.0, 7.0, 8.0], &[1, 3, 5], &mut dst, AssignOp::Assign);
        assert_eq!(n, 2);
        assert_eq!(dst, vec![6.0, 8.0, 0.0]);
    }

    #[test]
    fn test_kv_match_disjoint_untouched() {
        let mut dst = vec![5.0, 6.0];
        let n = kv_match(&[10, 20], &[1.0, 2.0], &[1, 2], &mut dst, AssignOp::Plus);
        assert_eq!(n, 0);
        assert_eq!(dst, vec![5.0, 6.0]);
    }

    #[test]
    fn test_kv_match_applied_exactly_once() {
        let mut dst = vec![1.0, 1.0];
        let n = kv_match(&[2, 4], &[10.0, 20.0], &[2, 4], &mut dst, AssignOp::Plus);
        assert_eq!(n, 2);
        assert_eq!(dst, vec![11.0, 21.0]);
    }

    #[test]
    fn test_kv_match_vector_values() {
        let mut dst = Vec::new();
        let n = kv_match(
            &[1, 3],
            &[1.0, 2.0, 3.0, 4.0],
            &[0, 1, 3],
            &mut dst,
            AssignOp::Assign,
        );
        assert_eq!(n, 2);
        assert_eq!(dst, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_remove_tail() {
        let kept = remove_tail_features(&[1, 2, 3], &[5.0, 4.0, 10.0], 4);
        assert_eq!(kept, vec![1, 3]);
    }

    #[test]
    fn test_merge_counts_shared() {
        let (k, c) = merge_counts(&[1, 3], &[1.0, 1.0], &[3, 9], &[2.0, 5.0]);
        assert_eq!(k, vec![1, 3, 9]);
        assert_eq!(c, vec![1.0, 3.0, 5.0]);
    }
}
