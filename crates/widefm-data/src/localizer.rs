//! Feature-ID compaction.
//!
//! Server traffic and worker arithmetic both want dense column positions,
//! not raw 64-bit IDs. The localizer turns a `RowBlock<FeaId>` into a
//! `RowBlock<u32>` indexed into a sorted unique key list, so a pull of that
//! key list lines the weight vector up with the block's columns.
//!
//! Invariant: `feaids[new_index[j]] == old_index[j]` for every nonzero `j`.

use std::collections::HashMap;

use widefm_core::{FeaId, SArray};

use crate::rowblock::RowBlock;

/// A localized mini-batch: compacted block plus its key list.
#[derive(Debug, Clone)]
pub struct Localized {
    /// Sorted unique feature IDs appearing in the block.
    pub feaids: SArray<FeaId>,
    /// Appearance count per key, present when requested.
    pub counts: Option<SArray<f32>>,
    /// The block with `index[]` rewritten to positions into `feaids`.
    pub data: RowBlock<u32>,
}

/// Compacts a row block's feature IDs into dense column positions.
pub fn localize(block: &RowBlock<FeaId>, want_counts: bool) -> Localized {
    let mut ids: Vec<FeaId> = block.index.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let pos: HashMap<FeaId, u32> = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i as u32))
        .collect();

    let mut counts = want_counts.then(|| vec![0f32; ids.len()]);
    let index: SArray<u32> = block
        .index
        .iter()
        .map(|id| {
            let p = pos[id];
            if let Some(c) = counts.as_mut() {
                c[p as usize] += 1.0;
            }
            p
        })
        .collect();

    Localized {
        feaids: ids.into(),
        counts: counts.map(Into::into),
        data: RowBlock {
            offset: block.offset.clone(),
            index,
            value: block.value.clone(),
            label: block.label.clone(),
            weight: block.weight.clone(),
            field: block.field.clone(),
        },
    }
}

/// Merges sorted unique `(key, count)` lists, summing counts of shared keys.
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
