//! The SGD/AdaGrad updater for FM and FFM models.
//!
//! State per feature: an embedding `V` of `dim` coordinates, an AdaGrad
//! accumulator `Z` of `2·dim` (the second half reserved for an FTRL z so
//! model files stay layout-compatible), the appearance count, and the
//! nonzero count. `V` is materialized lazily, the first time the count
//! exceeds `V_threshold`; pulls of unmaterialized entries return length
//! zero and their gradients are skipped.
//!
//! Per coordinate the update is AdaGrad with weight decay:
//!
//! ```text
//! g  = gV[i] + λ₂·V[i]
//! Z  = sqrt(Z² + g²)
//! V -= η · g / (Z + β)
//! ```
//!
//! The leading coordinate uses `lr`/`lr_beta`/`l2` (it carries the linear
//! term when the loss wants one); the remaining coordinates use
//! `V_lr`/`V_lr_beta`/`V_l2`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use widefm_core::feaid::reverse_bytes;
use widefm_core::{FeaId, KwArgs, Progress, SArray};
use widefm_store::updater::Result;
use widefm_store::{Updater, UpdaterError, ValueKind};

/// Configuration of the SGD updater.
#[derive(Debug, Clone)]
pub struct SgdUpdaterParam {
    /// L1 regularizer on the linear coordinate (penalty reporting).
    pub l1: f32,
    /// L2 regularizer on the linear coordinate.
    pub l2: f32,
    /// L2 regularizer on the embedding coordinates.
    pub v_l2: f32,
    /// Learning rate of the linear coordinate.
    pub lr: f32,
    /// AdaGrad denominator offset of the linear coordinate.
    pub lr_beta: f32,
    /// Learning rate of the embedding coordinates.
    pub v_lr: f32,
    /// AdaGrad denominator offset of the embedding coordinates.
    pub v_lr_beta: f32,
    /// V is initialized uniformly in `[-V_init_scale, +V_init_scale]`.
    pub v_init_scale: f32,
    /// Minimal appearance count before V is materialized.
    pub v_threshold: i32,
    /// Embedding dimension.
    pub v_dim: usize,
    /// Number of fields (FFM); 1 otherwise.
    pub field_num: usize,
    /// Random seed for V initialization.
    pub seed: u64,
    /// Entry width override; 0 derives `v_dim * field_num`.
    pub dim: usize,
}

impl SgdUpdaterParam {
    /// Consumes the updater keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        let v_threshold: i32 = kwargs.take_or("V_threshold", 0)?;
        // Tail features are never weighted: the stricter of the two
        // thresholds gates materialization.
        let tail: i32 = kwargs.take_or("tail_feature_filter", 0)?;
        Ok(Self {
            l1: kwargs.take_or("l1", 1.0)?,
            l2: kwargs.take_or("l2", 0.0)?,
            v_l2: kwargs.take_or("V_l2", 0.01)?,
            lr: kwargs.take_or("lr", 0.01)?,
            lr_beta: kwargs.take_or("lr_beta", 1.0)?,
            v_lr: kwargs.take_or("V_lr", 0.01)?,
            v_lr_beta: kwargs.take_or("V_lr_beta", 1.0)?,
            v_init_scale: kwargs.take_or("V_init_scale", 1.0)?,
            v_threshold: v_threshold.max(tail),
            v_dim: kwargs.take_or("V_dim", 4usize)?,
            field_num: kwargs.take_or("field_num", 1usize)?,
            seed: kwargs.take_or("seed", 0u64)?,
            dim: 0,
        })
    }

    /// The entry width in coordinates.
    pub fn dim(&self) -> usize {
        if self.dim > 0 {
            self.dim
        } else {
            self.v_dim * self.field_num.max(1)
        }
    }
}

/// The weight entry for one feature.
#[derive(Debug, Default)]
struct SgdEntry {
    fea_cnt: f32,
    nnz: i32,
    v: Vec<f32>,
    z: Vec<f32>,
}

impl SgdEntry {
    #[inline]
    fn materialized(&self) -> bool {
        !self.v.is_empty()
    }

    #[inline]
    fn empty(&self) -> bool {
        !self.materialized() || self.nnz == 0
    }
}

type EntryRef = Arc<Mutex<SgdEntry>>;

/// The SGD/AdaGrad updater.
pub struct SgdUpdater {
    param: SgdUpdaterParam,
    dim: usize,
    coef: f32,
    model: Mutex<BTreeMap<FeaId, EntryRef>>,
    /// Nonzero-count delta since the last report.
    new_w: Mutex<f64>,
}

impl SgdUpdater {
    /// Creates the updater.
    pub fn new(param: SgdUpdaterParam) -> Self {
        let dim = param.dim();
        Self {
            coef: 1.0 / (param.v_dim.max(1) as f32).sqrt(),
            dim,
            param,
            model: Mutex::new(BTreeMap::new()),
            new_w: Mutex::new(0.0),
        }
    }

    /// The configured parameters.
    pub fn param(&self) -> &SgdUpdaterParam {
        &self.param
    }

    /// Entry width in coordinates.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Find-or-insert under the map lock; updates lock the entry only.
    fn entry(&self, key: FeaId) -> EntryRef {
        let mut model = self.model.lock();
        Arc::clone(model.entry(key).or_default())
    }

    /// Read-only lookup.
    fn find(&self, key: FeaId) -> Option<EntryRef> {
        self.model.lock().get(&key).cloned()
    }

    fn init_v(&self, key: FeaId, e: &mut SgdEntry) {
        let mut rng = StdRng::seed_from_u64(self.param.seed ^ key);
        e.v = (0..self.dim)
            .map(|_| {
                if self.param.v_init_scale == 0.0 {
                    0.0
                } else {
                    self.coef
                        * rng.gen_range(-self.param.v_init_scale..=self.param.v_init_scale)
                }
            })
            .collect();
        e.z = vec![0.0; 2 * self.dim];
        e.nnz = e.v.iter().filter(|&&v| v != 0.0).count() as i32;
        *self.new_w.lock() += e.nnz as f64;
    }

    fn update_v(&self, gv: &[f32], e: &mut SgdEntry) {
        let nnz_before = e.nnz;
        for i in 0..self.dim {
            let (lr, beta, l2) = if i == 0 {
                (self.param.lr, self.param.lr_beta, self.param.l2)
            } else {
                (self.param.v_lr, self.param.v_lr_beta, self.param.v_l2)
            };
            let vi = e.v[i];
            let g = gv[i] + l2 * vi;
            e.z[i] = (e.z[i] * e.z[i] + g * g).sqrt();
            e.v[i] -= lr * g / (e.z[i] + beta);

            if vi == 0.0 && e.v[i] != 0.0 {
                e.nnz += 1;
            } else if vi != 0.0 && e.v[i] == 0.0 {
                e.nnz -= 1;
            }
        }
        *self.new_w.lock() += (e.nnz - nnz_before) as f64;
    }
}

impl Updater for SgdUpdater {
    fn get(&self, keys: &SArray<FeaId>, kind: ValueKind) -> Result<(SArray<f32>, SArray<i32>)> {
        match kind {
            ValueKind::FeaCount => {
                let vals: Vec<f32> = keys
                    .iter()
                    .map(|&k| {
                        self.find(k).map_or(0.0, |e| e.lock().fea_cnt)
                    })
                    .collect();
                Ok((vals.into(), Default::default()))
            }
            ValueKind::Weight => {
                let mut vals = Vec::new();
                let mut lens = Vec::with_capacity(keys.len());
                for &k in keys.iter() {
                    match self.find(k) {
                        Some(e) => {
                            let e = e.lock();
                            if e.materialized() {
                                vals.extend_from_slice(&e.v);
                                lens.push(self.dim as i32);
                            } else {
                                lens.push(0);
                            }
                        }
                        None => lens.push(0),
                    }
                }
                Ok((vals.into(), lens.into()))
            }
            ValueKind::Gradient => Err(UpdaterError::KindMismatch { kind }),
        }
    }

    fn update(
        &self,
        keys: &SArray<FeaId>,
        kind: ValueKind,
        values: &SArray<f32>,
        lens: &SArray<i32>,
    ) -> Result<()> {
        match kind {
            ValueKind::FeaCount => {
                if keys.len() != values.len() {
                    return Err(UpdaterError::DimMismatch(format!(
                        "{} keys, {} counts",
                        keys.len(),
                        values.len()
                    )));
                }
                for (&k, &c) in keys.iter().zip(values.iter()) {
                    let e = self.entry(k);
                    let mut e = e.lock();
                    e.fea_cnt += c;
                    if !e.materialized() && e.fea_cnt > self.param.v_threshold as f32 {
                        self.init_v(k, &mut e);
                    }
                }
                Ok(())
            }
            ValueKind::Gradient => {
                if !lens.is_empty() && lens.len() != keys.len() {
                    return Err(UpdaterError::DimMismatch(format!(
                        "{} keys, {} lens",
                        keys.len(),
                        lens.len()
                    )));
                }
                let mut p = 0usize;
                for (i, &k) in keys.iter().enumerate() {
                    let len = if lens.is_empty() {
                        self.dim
                    } else {
                        lens[i] as usize
                    };
                    if len == 0 {
                        continue;
                    }
                    if len != self.dim {
                        return Err(UpdaterError::DimMismatch(format!(
                            "gradient length {} for dim {}",
                            len, self.dim
                        )));
                    }
                    let e = self.entry(k);
                    let mut e = e.lock();
                    if !e.materialized() {
                        return Err(UpdaterError::NotMaterialized(k));
                    }
                    self.update_v(&values[p..p + len], &mut e);
                    p += len;
                }
                if p != values.len() {
                    return Err(UpdaterError::DimMismatch(format!(
                        "consumed {} of {} gradient values",
                        p,
                        values.len()
                    )));
                }
                Ok(())
            }
            ValueKind::Weight => Err(UpdaterError::KindMismatch { kind }),
        }
    }

    fn load(&self, reader: &mut dyn Read) -> Result<u64> {
        let mut flag = [0u8; 1];
        if reader.read_exact(&mut flag).is_err() {
            return Ok(0); // empty model file
        }
        let has_aux = flag[0] != 0;
        let mut loaded = 0u64;
        let mut model = self.model.lock();
        loop {
            let mut key_buf = [0u8; 8];
            match reader.read_exact(&mut key_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let key = FeaId::from_le_bytes(key_buf);
            let mut size_buf = [0u8; 4];
            reader.read_exact(&mut size_buf)?;
            let size = i32::from_le_bytes(size_buf);
            if size < 0 || size as usize != self.dim {
                return Err(UpdaterError::Corrupt(format!(
                    "entry size {} does not match dim {}",
                    size, self.dim
                )));
            }
            let size = size as usize;
            let mut e = SgdEntry {
                fea_cnt: (self.param.v_threshold + 1) as f32,
                nnz: 0,
                v: read_f32s(reader, size)?,
                z: vec![0.0; 2 * size],
            };
            if has_aux {
                e.z = read_f32s(reader, 2 * size)?;
            }
            e.nnz = e.v.iter().filter(|&&v| v != 0.0).count() as i32;
            model.insert(key, Arc::new(Mutex::new(e)));
            loaded += 1;
        }
        info!("loaded {} kv pairs", loaded);
        Ok(loaded)
    }

    fn save(&self, save_aux: bool, writer: &mut dyn Write) -> Result<u64> {
        writer.write_all(&[save_aux as u8])?;
        let mut saved = 0u64;
        let model = self.model.lock();
        for (&key, e) in model.iter() {
            let e = e.lock();
            if e.empty() {
                continue;
            }
            writer.write_all(&key.to_le_bytes())?;
            writer.write_all(&(self.dim as i32).to_le_bytes())?;
            write_f32s(writer, &e.v)?;
            if save_aux {
                write_f32s(writer, &e.z)?;
            }
            saved += 1;
        }
        info!("saved {} kv pairs", saved);
        Ok(saved)
    }

    fn dump(&self, dump_aux: bool, need_reverse: bool, writer: &mut dyn Write) -> Result<u64> {
        let mut dumped = 0u64;
        let model = self.model.lock();
        for (&key, e) in model.iter() {
            let e = e.lock();
            if e.empty() {
                continue;
            }
            let key = if need_reverse { reverse_bytes(key) } else { key };
            write!(writer, "{}\t{}", key, self.dim)?;
            for v in &e.v {
                write!(writer, "\t{}", v)?;
            }
            if dump_aux {
                for z in &e.z {
                    write!(writer, "\t{}", z)?;
                }
            }
            writeln!(writer)?;
            dumped += 1;
        }
        info!("dumped {} kv pairs", dumped);
        Ok(dumped)
    }

    fn report(&self) -> Progress {
        let mut new_w = self.new_w.lock();
        let prog = Progress {
            nnz_w: *new_w,
            ..Default::default()
        };
        *new_w = 0.0;
        prog
    }

    fn evaluate(&self, prog: &mut Progress) {
        let model = self.model.lock();
        for e in model.values() {
            let e = e.lock();
            if !e.materialized() {
                continue;
            }
            for (i, &v) in e.v.iter().enumerate() {
                if v == 0.0 {
                    continue;
                }
                prog.nnz_w += 1.0;
                if i == 0 {
                    prog.penalty +=
                        (self.param.l1 * v.abs() + 0.5 * self.param.l2 * v * v) as f64;
                } else {
                    prog.penalty += (0.5 * self.param.v_l2 * v * v) as f64;
                }
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn read_f32s(reader: &mut dyn Read, n: usize) -> Result<Vec<f32>> {
    let mut buf = vec![0u8; n * 4];
    reader.read_exact(&mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_f32s(writer: &mut dyn Write, vals: &[f32]) -> Result<()> {
    for &v in vals {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}
