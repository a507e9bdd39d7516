//! Mergeable distance distribution summary backed by a t-digest.

use std::mem;

use tdigest::TDigest;

/// Pending values are folded into the digest once this many times
/// `max_size` have been buffered.
const PENDING_FACTOR: usize = 16;

/// Bounded-memory quantile sketch.
///
/// Insertions are buffered and compressed into the digest in batches, since
/// `TDigest` is rebuilt on every merge. Memory per sketch is bounded by
/// `max_size` centroids plus `max_size * PENDING_FACTOR` buffered values.
#[derive(Debug, Clone)]
pub struct DistanceSketch {
    digest: TDigest,
    pending: Vec<f64>,
    max_size: usize,
}

impl DistanceSketch {
    pub fn new(max_size: usize) -> Self {
        Self {
            digest: TDigest::new_with_size(max_size),
            pending: Vec::new(),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn insert(&mut self, value: f64) {
        self.pending.push(value);
        if self.pending.len() >= self.max_size * PENDING_FACTOR {
            self.flush();
        }
    }

    /// Number of observations summarised, buffered ones included.
    pub fn count(&self) -> u64 {
        self.digest.count() as u64 + self.pending.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.digest.is_empty() && self.pending.is_empty()
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let values = mem::take(&mut self.pending);
        self.digest = self.digest.merge_unsorted(values);
    }

    /// Structural merge of two digests. Both inputs are compressed first so
    /// the result carries no buffered values from either side.
    pub fn merge(&mut self, mut other: DistanceSketch) {
        self.flush();
        other.flush();

        if other.digest.is_empty() {
            return;
        }
        if self.digest.is_empty() {
            self.digest = other.digest;
            return;
        }

        let ours = mem::take(&mut self.digest);
        self.digest = TDigest::merge_digests(vec![ours, other.digest]);
    }

    /// Estimated value at rank `q` in `[0, 1]`, or `None` if empty.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.flush();
        if self.digest.is_empty() {
            return None;
        }
        Some(self.digest.estimate_quantile(q.clamp(0.0, 1.0)))
    }
}
