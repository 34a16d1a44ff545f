//! Common learner configuration.

use widefm_core::KwArgs;

/// Options shared by every learner, read from the configuration.
#[derive(Debug, Clone)]
pub struct LearnerParam {
    /// Task: `train` (default) or `pred`.
    pub task: String,
    /// Loss name: `logit`, `fm` or `ffm`.
    pub loss: String,
    /// Training data URI.
    pub data_in: String,
    /// Optional validation data URI.
    pub data_val: String,
    /// Data format; `libfm` is built in.
    pub data_format: String,
    /// Model to load before training or predicting.
    pub model_in: String,
    /// Where to save the trained model.
    pub model_out: String,
    /// Where prediction jobs write their output.
    pub pred_out: String,
    /// Write predictions as logistic probabilities.
    pub pred_prob: bool,
    /// Maximal number of data passes.
    pub max_num_epochs: usize,
    /// Epoch of `model_in` to load; -1 for the bare name.
    pub load_epoch: i32,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Shuffle buffer scale: `batch_size * shuffle` rows.
    pub shuffle: usize,
    /// Keep negatives with this probability, re-weighted.
    pub neg_sampling: f32,
    /// Jobs per worker per epoch.
    pub num_jobs_per_epoch: usize,
    /// Seconds between scheduler progress lines.
    pub report_interval: u64,
    /// Stop when the relative objective change falls below this.
    pub stop_rel_objv: f64,
    /// Stop when the validation AUC gain falls below this.
    pub stop_val_auc: f64,
    /// Save and dump optimizer state alongside weights.
    pub has_aux: bool,
    /// In-process server count.
    pub num_servers: usize,
    /// In-process worker count.
    pub num_workers: usize,
    /// Seed for shuffling and initialization.
    pub seed: u64,
    /// Byte-reverse feature IDs on ingest.
    pub reverse_feaid: bool,
    /// Bits of feature-group ID packed into feature IDs.
    pub fea_group_nbits: u32,
    /// Workload straggler timeout in milliseconds; 0 relies on the mean.
    pub straggler_timeout: u64,
    /// Shuffle the workload part assignment.
    pub shuffle_parts: bool,
    /// Directory for spilled tiles; empty keeps tiles in memory.
    pub data_cache: String,
    /// In-memory tile budget in megabytes.
    pub tile_mem_mb: usize,
}

impl LearnerParam {
    /// Consumes the shared learner keys from the configuration.
    pub fn init(kwargs: &mut KwArgs) -> widefm_core::Result<Self> {
        let shuffle: usize = kwargs.take_or("shuffle", 10usize)?;
        Ok(Self {
            task: kwargs.take_or("task", "train".to_string())?,
            loss: kwargs.take_or("loss", "logit".to_string())?,
            data_in: kwargs.take_or("data_in", String::new())?,
            data_val: kwargs.take_or("data_val", String::new())?,
            data_format: kwargs.take_or("data_format", "libfm".to_string())?,
            model_in: kwargs.take_or("model_in", String::new())?,
            model_out: kwargs.take_or("model_out", String::new())?,
            pred_out: kwargs.take_or("pred_out", String::new())?,
            pred_prob: kwargs.take_or("pred_prob", true)?,
            max_num_epochs: kwargs.take_or("max_num_epochs", 20usize)?,
            load_epoch: kwargs.take_or("load_epoch", -1i32)?,
            batch_size: kwargs.take_or("batch_size", 100usize)?,
            neg_sampling: kwargs.take_or("neg_sampling", 1.0f32)?,
            num_jobs_per_epoch: kwargs.take_or("num_jobs_per_epoch", 10usize)?,
            report_interval: kwargs.take_or("report_interval", 1u64)?,
            stop_rel_objv: kwargs.take_or("stop_rel_objv", 1e-6f64)?,
            stop_val_auc: kwargs.take_or("stop_val_auc", 1e-5f64)?,
            has_aux: kwargs.take_or("has_aux", false)?,
            num_servers: kwargs.take_or("num_servers", 1usize)?,
            num_workers: kwargs.take_or("num_workers", 1usize)?,
            seed: kwargs.take_or("seed", 0u64)?,
            reverse_feaid: kwargs.take_or("reverse_feaid", true)?,
            fea_group_nbits: kwargs.take_or("fea_group_nbits", 0u32)?,
            straggler_timeout: kwargs.take_or("straggler_timeout", 0u64)?,
            shuffle_parts: shuffle > 0,
            data_cache: kwargs.take_or("data_cache", String::new())?,
            tile_mem_mb: kwargs.take_or("tile_mem_mb", 1024usize)?,
            shuffle,
        })
    }

    /// Reader configuration for one part of a URI.
    pub fn reader_config(
        &self,
        uri: &str,
        part_index: usize,
        num_parts: usize,
        chunk_size: usize,
    ) -> widefm_data::ReaderConfig {
        widefm_data::ReaderConfig {
            uri: uri.to_string(),
            format: self.data_format.clone(),
            part_index,
            num_parts,
            chunk_size,
            libfm: widefm_data::libfm::LibfmOptions {
                reverse_feaid: self.reverse_feaid,
                fea_group_nbits: self.fea_group_nbits,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = LearnerParam::init(&mut KwArgs::new()).unwrap();
        assert_eq!(p.task, "train");
        assert_eq!(p.batch_size, 100);
        assert_eq!(p.max_num_epochs, 20);
        assert!(p.reverse_feaid);
        assert_eq!(p.num_workers, 1);
    }

    #[test]
    fn test_overrides() {
        let mut kw = KwArgs::from_args(
            ["batch_size=1", "num_jobs_per_epoch=3", "shuffle=0", "loss=fm"].iter(),
        );
        let p = LearnerParam::init(&mut kw).unwrap();
        assert_eq!(p.batch_size, 1);
        assert_eq!(p.num_jobs_per_epoch, 3);
        assert!(!p.shuffle_parts);
        assert_eq!(p.loss, "fm");
        assert!(kw.remaining().is_empty());
    }
}
