//! Jobs: the tagged messages the tracker dispatches.

use serde::{Deserialize, Serialize};

/// What a dispatched job asks its executor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    /// Train on one data part.
    Train,
    /// Evaluate on one validation part.
    Validate,
    /// Predict on one data part, writing `pred_out`.
    Predict,
    /// Load the model shard from disk.
    LoadModel,
    /// Save the model shard to disk.
    SaveModel,
    /// Read and tile the training data.
    PrepareData,
    /// Freeze server-side weights after the count push.
    InitServer,
    /// Build worker state and the first gradient.
    InitWorker,
    /// Push the accumulated gradient to the servers.
    PushGradient,
    /// Emit the inner products for the direction solve.
    PrepareDirection,
    /// Combine the search direction from solved coefficients.
    CalcDirection,
    /// Try a step size; return objective and directional derivative.
    LineSearch,
    /// Fold model statistics into the epoch progress.
    Evaluate,
}

/// One unit of work sent from the scheduler to a worker or server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// What to do.
    pub job_type: JobType,
    /// The current epoch.
    pub epoch: i32,
    /// The data part to process; -1 means all.
    pub part_idx: i32,
    /// Total number of parts this epoch.
    pub num_parts: i32,
    /// Small numeric arguments (step sizes, coefficients).
    pub value: Vec<f32>,
}

impl Job {
    /// A job with no part assignment or arguments.
    pub fn new(job_type: JobType, epoch: i32) -> Self {
        Self {
            job_type,
            epoch,
            part_idx: -1,
            num_parts: 0,
            value: Vec::new(),
        }
    }

    /// Attaches numeric arguments.
    pub fn with_value(mut self, value: Vec<f32>) -> Self {
        self.value = value;
        self
    }

    /// Serializes for the transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("job serialization cannot fail")
    }

    /// Deserializes from the transport; `None` for malformed bodies.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let job = Job {
            job_type: JobType::LineSearch,
            epoch: 3,
            part_idx: 7,
            num_parts: 16,
            value: vec![0.5, -1.0],
        };
        let back = Job::from_bytes(&job.to_bytes()).unwrap();
        assert_eq!(back.job_type, JobType::LineSearch);
        assert_eq!(back.epoch, 3);
        assert_eq!(back.part_idx, 7);
        assert_eq!(back.value, vec![0.5, -1.0]);
    }

    #[test]
    fn test_malformed_bytes_are_none() {
        assert!(Job::from_bytes(&[1, 2, 3]).is_none());
    }
}
