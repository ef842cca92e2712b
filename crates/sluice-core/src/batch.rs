//! Fixed-size batching of samples into [`FetchBatch`]es.

use crate::request::FetchBatch;

/// Default maximum number of samples per published batch.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Accumulates samples for one (data frame, stream) pair.
pub struct Batcher {
    capacity: usize,
    data_frame: String,
    identifier: String,
    times: Vec<i64>,
    values: Vec<f64>,
}

impl Batcher {
    pub fn new(capacity: usize, data_frame: &str, identifier: &str) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            data_frame: data_frame.to_string(),
            identifier: identifier.to_string(),
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Add a sample. Returns a batch once `capacity` samples are held.
    pub fn push(&mut self, time: i64, value: f64) -> Option<FetchBatch> {
        self.times.push(time);
        self.values.push(value);
        if self.times.len() >= self.capacity {
            Some(self.take())
        } else {
            None
        }
    }

    /// Remaining samples, if any.
    pub fn flush(&mut self) -> Option<FetchBatch> {
        if self.times.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> FetchBatch {
        FetchBatch {
            data_frame: self.data_frame.clone(),
            identifier: self.identifier.clone(),
            times: std::mem::replace(&mut self.times, Vec::with_capacity(self.capacity)),
            values: std::mem::replace(&mut self.values, Vec::with_capacity(self.capacity)),
        }
    }
}
