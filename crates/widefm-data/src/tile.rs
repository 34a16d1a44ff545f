//! Tiles: persisted slices of training data for the batched optimizers.
//!
//! The stochastic learner streams text every epoch, but L-BFGS and block
//! coordinate descent revisit the same data dozens of times. During their
//! prepare-data phase each localized row block is cut into one [`Tile`] per
//! feature-column block and handed to the [`TileStore`], which keeps tiles
//! in memory up to a budget and spills the rest to disk as bincode files.
//! `prefetch` pins a tile back into memory before compute.
//!
//! A tile carries a **column map**: for each packed column of the tile,
//! the position of its feature inside the column block's kept key list, or
//! `-1` when the feature was removed by the tail-feature filter.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use widefm_core::{FeaId, SArray};

use crate::error::{DataError, Result};
use crate::localizer::{localize, merge_counts, Localized};
use crate::rowblock::RowBlock;

/// An inclusive range of feature IDs forming one column block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColRange {
    /// First feature ID of the range.
    pub begin: FeaId,
    /// Last feature ID of the range (inclusive).
    pub end: FeaId,
}

impl ColRange {
    /// Splits the whole 64-bit key space into `n` even ranges.
    pub fn split_space(n: usize) -> Vec<ColRange> {
        let n = n.max(1) as u128;
        let span = (u64::MAX as u128 + 1) / n;
        (0..n)
            .map(|i| {
                let begin = (i * span) as FeaId;
                let end = if i + 1 == n {
                    u64::MAX
                } else {
                    ((i + 1) * span - 1) as FeaId
                };
                ColRange { begin, end }
            })
            .collect()
    }

    /// Returns the sub-slice `[lo, hi)` of a sorted key list inside this range.
    pub fn locate(&self, keys: &[FeaId]) -> (usize, usize) {
        let lo = keys.partition_point(|&k| k < self.begin);
        let hi = keys.partition_point(|&k| k <= self.end);
        (lo, hi)
    }
}

/// A horizontal slice of training data restricted to one column block.
#[derive(Debug, Clone)]
pub struct Tile {
    /// The localized data; `index[]` is packed per-tile.
    pub data: RowBlock<u32>,
    /// Packed column -> position in the column block's kept key list, or -1.
    pub colmap: SArray<i32>,
}

/// Flat serializable form of a tile for disk spill.
#[derive(Serialize, Deserialize)]
struct TileRecord {
    offset: Vec<usize>,
    index: Vec<u32>,
    value: Option<Vec<f32>>,
    label: Option<Vec<f32>>,
    weight: Option<Vec<f32>>,
    field: Option<Vec<u32>>,
    colmap: Vec<i32>,
}

impl From<&Tile> for TileRecord {
    fn from(t: &Tile) -> Self {
        Self {
            offset: t.data.offset.to_vec(),
            index: t.data.index.to_vec(),
            value: t.data.value.as_ref().map(|a| a.to_vec()),
            label: t.data.label.as_ref().map(|a| a.to_vec()),
            weight: t.data.weight.as_ref().map(|a| a.to_vec()),
            field: t.data.field.as_ref().map(|a| a.to_vec()),
            colmap: t.colmap.to_vec(),
        }
    }
}

impl From<TileRecord> for Tile {
    fn from(r: TileRecord) -> Self {
        Tile {
            data: RowBlock {
                offset: r.offset.into(),
                index: r.index.into(),
                value: r.value.map(Into::into),
                label: r.label.map(Into::into),
                weight: r.weight.map(Into::into),
                field: r.field.map(Into::into),
            },
            colmap: r.colmap.into(),
        }
    }
}

fn tile_bytes(t: &Tile) -> usize {
    t.data.offset.len() * 8 + t.data.index.len() * 4 + t.colmap.len() * 4
        + t.data.value.as_ref().map_or(0, |a| a.len() * 4)
        + t.data.label.as_ref().map_or(0, |a| a.len() * 4)
        + t.data.weight.as_ref().map_or(0, |a| a.len() * 4)
        + t.data.field.as_ref().map_or(0, |a| a.len() * 4)
}

struct StoreInner {
    cache: HashMap<(usize, usize), Arc<Tile>>,
    spilled: HashSet<(usize, usize)>,
    cached_bytes: usize,
}

/// Keyed tile storage with an in-memory budget and disk spill.
pub struct TileStore {
    inner: Mutex<StoreInner>,
    spill_dir: Option<PathBuf>,
    mem_budget: usize,
}

impl TileStore {
    /// Creates a store keeping up to `mem_budget` bytes of tiles in memory;
    /// tiles beyond that go to `spill_dir` (required for spilling).
    pub fn new(spill_dir: Option<PathBuf>, mem_budget: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                cache: HashMap::new(),
                spilled: HashSet::new(),
                cached_bytes: 0,
            }),
            spill_dir,
            mem_budget,
        }
    }

    fn spill_path(&self, key: (usize, usize)) -> Option<PathBuf> {
        self.spill_dir
            .as_ref()
            .map(|d| d.join(format!("tile_{}_{}.bin", key.0, key.1)))
    }

    /// Inserts a tile, spilling it to disk when over the memory budget.
    pub fn insert(&self, rowblk: usize, colblk: usize, tile: Tile) -> Result<()> {
        let key = (rowblk, colblk);
        let bytes = tile_bytes(&tile);
        let mut inner = self.inner.lock();
        if inner.cached_bytes + bytes > self.mem_budget {
            if let Some(path) = self.spill_path(key) {
                let file = File::create(&path)
                    .map_err(|e| DataError::io(path.display().to_string(), e))?;
                bincode::serialize_into(BufWriter::new(file), &TileRecord::from(&tile))?;
                inner.spilled.insert(key);
                debug!(rowblk, colblk, bytes, "spilled tile to disk");
                return Ok(());
            }
        }
        inner.cached_bytes += bytes;
        inner.cache.insert(key, Arc::new(tile));
        Ok(())
    }

    fn load_spilled(&self, key: (usize, usize)) -> Result<Arc<Tile>> {
        let path = self
            .spill_path(key)
            .ok_or(DataError::TileNotFound(key.0, key.1))?;
        let file =
            File::open(&path).map_err(|e| DataError::io(path.display().to_string(), e))?;
        let record: TileRecord = bincode::deserialize_from(BufReader::new(file))?;
        Ok(Arc::new(record.into()))
    }

    /// Pins a tile into memory ahead of its use.
    pub fn prefetch(&self, rowblk: usize, colblk: usize) -> Result<()> {
        let key = (rowblk, colblk);
        {
            let inner = self.inner.lock();
            if inner.cache.contains_key(&key) {
                return Ok(());
            }
            if !inner.spilled.contains(&key) {
                return Err(DataError::TileNotFound(rowblk, colblk));
            }
        }
        let tile = self.load_spilled(key)?;
        self.inner.lock().cache.insert(key, tile);
        Ok(())
    }

    /// Fetches a tile from memory, loading it from disk if spilled.
    pub fn fetch(&self, rowblk: usize, colblk: usize) -> Result<Arc<Tile>> {
        let key = (rowblk, colblk);
        {
            let inner = self.inner.lock();
            if let Some(tile) = inner.cache.get(&key) {
                return Ok(Arc::clone(tile));
            }
            if !inner.spilled.contains(&key) {
                return Err(DataError::TileNotFound(rowblk, colblk));
            }
        }
        self.load_spilled(key)
    }

    /// Drops prefetched copies of spilled tiles from the cache.
    pub fn evict_prefetched(&self) {
        let mut inner = self.inner.lock();
        let spilled: Vec<_> = inner
            .cache
            .keys()
            .filter(|k| inner.spilled.contains(k))
            .copied()
            .collect();
        for key in spilled {
            inner.cache.remove(&key);
        }
    }
}

/// Builds the tile store during the prepare-data phase.
///
/// `add` localizes and parks incoming row blocks while accumulating the
/// merged feature-ID list and appearance counts; after the kept key set is
/// frozen, `build_colmap` cuts each parked block into per-column-block tiles
/// and moves them into the store.
pub struct TileBuilder {
    store: Arc<TileStore>,
    feaids: Vec<FeaId>,
    counts: Vec<f32>,
    pending: Vec<Localized>,
    row_counts: Vec<usize>,
}

impl TileBuilder {
    /// Creates a builder feeding `store`.
    pub fn new(store: Arc<TileStore>) -> Self {
        Self {
            store,
            feaids: Vec::new(),
            counts: Vec::new(),
            pending: Vec::new(),
            row_counts: Vec::new(),
        }
    }

    /// Adds one row block; returns its row-block ID.
    ///
    /// `with_counts` merges the block's appearance counts into the
    /// builder's tally; validation blocks pass false so they never affect
    /// the tail-feature filter.
    pub fn add(&mut self, block: &RowBlock<FeaId>, with_counts: bool) -> usize {
        let local = localize(block, with_counts);
        if with_counts {
            let (keys, counts) = merge_counts(
                &self.feaids,
                &self.counts,
                &local.feaids,
                local.counts.as_ref().unwrap(),
            );
            self.feaids = keys;
            self.counts = counts;
        }
        self.row_counts.push(block.size());
        self.pending.push(local);
        self.pending.len() - 1
    }

    /// Number of row blocks added.
    pub fn num_blocks(&self) -> usize {
        self.pending.len()
    }

    /// Rows per added block, in add order.
    pub fn row_counts(&self) -> &[usize] {
        &self.row_counts
    }

    /// The merged sorted unique feature IDs seen so far.
    pub fn feaids(&self) -> SArray<FeaId> {
        self.feaids.clone().into()
    }

    /// Appearance counts aligned with [`feaids`](Self::feaids).
    pub fn counts(&self) -> SArray<f32> {
        self.counts.clone().into()
    }

    /// Freezes the kept key set and materializes tiles.
    ///
    /// `kept` is the sorted post-filter key list; `col_ranges` are the
    /// feature blocks. Every parked row block yields one tile per range;
    /// tile columns outside `kept` get colmap `-1`.
    pub fn build_colmap(&mut self, kept: &[FeaId], col_ranges: &[ColRange]) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (rowblk, local) in pending.iter().enumerate() {
            for (colblk, range) in col_ranges.iter().enumerate() {
                let tile = cut_tile(local, kept, *range);
                self.store.insert(rowblk, colblk, tile)?;
            }
        }
        info!(
            rowblks = self.row_counts.len(),
            colblks = col_ranges.len(),
            kept = kept.len(),
            "built tile store"
        );
        Ok(())
    }
}

/// Cuts the columns of `local` falling in `range` into a tile.
fn cut_tile(local: &Localized, kept: &[FeaId], range: ColRange) -> Tile {
    let keys = &local.feaids;
    let (lo, hi) = range.locate(keys);
    let (klo, khi) = range.locate(kept);
    let kept_blk = &kept[klo..khi];

    let colmap: SArray<i32> = keys[lo..hi]
        .iter()
        .map(|id| match kept_blk.binary_search(id) {
            Ok(p) => p as i32,
            Err(_) => -1,
        })
        .collect();

    let data = &local.data;
    let size = data.size();
    let mut offset = Vec::with_capacity(size + 1);
    offset.push(0usize);
    let mut index = Vec::new();
    let mut value = data.value.as_ref().map(|_| Vec::new());
    let mut field = data.field.as_ref().map(|_| Vec::new());
    for i in 0..size {
        for j in data.offset[i]..data.offset[i + 1] {
            let col = data.index[j] as usize;
            if col < lo || col >= hi {
                continue;
            }
            index.push((col - lo) as u32);
            if let (Some(out), Some(v)) = (value.as_mut(), data.value.as_ref()) {
                out.push(v[j]);
            }
            if let (Some(out), Some(f)) = (field.as_mut(), data.field.as_ref()) {
                out.push(f[j]);
            }
        }
        offset.push(index.len());
    }

    Tile {
        data: RowBlock {
            offset: offset.into(),
            index: index.into(),
            value: value.map(Into::into),
            label: data.label.clone(),
            weight: data.weight.clone(),
            field: field.map(Into::into),
        },
        colmap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowblock::RowBlockBuilder;

    fn block(rows: &[(f32, &[FeaId])]) -> RowBlock<FeaId> {
        let mut b = RowBlockBuilder::new();
        for (label, ids) in rows {
            let entries: Vec<(u32, FeaId, f32)> = ids.iter().map(|&i| (0, i, 1.0)).collect();
            b.push_row(*label, 1.0, &entries);
        }
        b.finish()
    }

    #[test]
    fn test_split_space_covers() {
        let ranges = ColRange::split_space(4);
        assert_eq!(ranges[0].begin, 0);
        assert_eq!(ranges[3].end, u64::MAX);
        for w in ranges.windows(2) {
            assert_eq!(w[0].end + 1, w[1].begin);
        }
    }

    #[test]
    fn test_builder_merges_counts() {
        let store = Arc::new(TileStore::new(None, usize::MAX));
        let mut builder = TileBuilder::new(store);
        builder.add(&block(&[(1.0, &[5, 9]), (-1.0, &[9])]), true);
        builder.add(&block(&[(1.0, &[5, 11])]), true);
        assert_eq!(&*builder.feaids(), &[5, 9, 11]);
        assert_eq!(&*builder.counts(), &[2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_colmap_marks_filtered() {
        let store = Arc::new(TileStore::new(None, usize::MAX));
        let mut builder = TileBuilder::new(Arc::clone(&store));
        builder.add(&block(&[(1.0, &[5, 9, 11]), (-1.0, &[9])]), true);
        // 9 is filtered out of the kept set.
        let kept = vec![5, 11];
        builder
            .build_colmap(&kept, &[ColRange { begin: 0, end: u64::MAX }])
            .unwrap();
        let tile = store.fetch(0, 0).unwrap();
        assert_eq!(&*tile.colmap, &[0, -1, 1]);
        assert_eq!(tile.data.size(), 2);
        // All columns are physically present; the colmap filters them.
        assert_eq!(&*tile.data.index, &[0, 1, 2, 1]);
    }

    #[test]
    fn test_column_blocks_partition_tile() {
        let store = Arc::new(TileStore::new(None, usize::MAX));
        let mut builder = TileBuilder::new(Arc::clone(&store));
        builder.add(&block(&[(1.0, &[1, 100]), (-1.0, &[100, 200])]), true);
        let kept = vec![1, 100, 200];
        let ranges = [
            ColRange { begin: 0, end: 99 },
            ColRange {
                begin: 100,
                end: u64::MAX,
            },
        ];
        builder.build_colmap(&kept, &ranges).unwrap();

        let left = store.fetch(0, 0).unwrap();
        assert_eq!(&*left.data.index, &[0]); // only feature 1
        assert_eq!(&*left.colmap, &[0]);

        let right = store.fetch(0, 1).unwrap();
        assert_eq!(&*right.data.index, &[0, 0, 1]); // 100, 100, 200
        assert_eq!(&*right.colmap, &[0, 1]); // positions within the block
        assert_eq!(right.data.size(), 2);
    }

    #[test]
    fn test_spill_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        // Zero budget forces every tile to disk.
        let store = Arc::new(TileStore::new(Some(dir.path().to_path_buf()), 0));
        let mut builder = TileBuilder::new(Arc::clone(&store));
        builder.add(&block(&[(1.0, &[3, 4]), (-1.0, &[4])]), true);
        builder
            .build_colmap(&[3, 4], &[ColRange { begin: 0, end: u64::MAX }])
            .unwrap();

        store.prefetch(0, 0).unwrap();
        let tile = store.fetch(0, 0).unwrap();
        assert_eq!(&*tile.colmap, &[0, 1]);
        assert_eq!(
            &**tile.data.label.as_ref().unwrap(),
            &[1.0, -1.0]
        );
        store.evict_prefetched();
        // Still fetchable straight from disk.
        assert!(store.fetch(0, 0).is_ok());
        assert!(matches!(
            store.fetch(7, 0),
            Err(DataError::TileNotFound(7, 0))
        ));
    }
}
