//! RTT quantile sketch.
//!
//! Thin wrapper around a t-digest that accepts weighted samples and answers
//! arbitrary quantile queries. Points are buffered and folded into the
//! digest in batches, since the underlying digest merges by value.

use tdigest::TDigest;

const DIGEST_SIZE: usize = 100;
const COMPRESS_THRESHOLD: usize = 512;

#[derive(Debug, Clone)]
pub struct RttSketch {
    digest: TDigest,
    pending: Vec<f64>,
    count: u64,
}

impl Default for RttSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl RttSketch {
    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(DIGEST_SIZE),
            pending: Vec::new(),
            count: 0,
        }
    }

    /// Add a sample with the given weight.
    pub fn add(&mut self, value: f64, weight: u64) {
        for _ in 0..weight {
            self.pending.push(value);
        }
        self.count += weight;
        if self.pending.len() >= COMPRESS_THRESHOLD {
            self.compress();
        }
    }

    /// Fold buffered points into the digest.
    pub fn compress(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let digest = std::mem::replace(&mut self.digest, TDigest::new_with_size(DIGEST_SIZE));
        let pending = std::mem::take(&mut self.pending);
        self.digest = digest.merge_unsorted(pending);
    }

    /// Estimate the value at quantile `q` in [0, 1]. Returns 0 for an empty
    /// sketch.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.pending.is_empty() {
            return self.digest.estimate_quantile(q);
        }
        let digest = self.digest.clone();
        digest.merge_unsorted(self.pending.clone()).estimate_quantile(q)
    }

    /// Number of samples added, counting weights.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sketch_answers_zero() {
        let sketch = RttSketch::new();
        assert_eq!(sketch.count(), 0);
        assert_eq!(sketch.quantile(0.5), 0.0);
    }

    #[test]
    fn median_of_small_set() {
        let mut sketch = RttSketch::new();
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            sketch.add(ms, 1);
        }
        assert_eq!(sketch.count(), 5);

        let p50 = sketch.quantile(0.5);
        assert!((p50 - 3.0).abs() < 0.5, "p50 was {p50}");
        assert!(sketch.quantile(0.95) >= sketch.quantile(0.5));
    }

    #[test]
    fn weighted_samples_count_by_weight() {
        let mut sketch = RttSketch::new();
        sketch.add(10.0, 3);
        sketch.add(20.0, 1);
        assert_eq!(sketch.count(), 4);
        // Three of four points sit at 10, so the median does too.
        assert!((sketch.quantile(0.5) - 10.0).abs() < 1.0);
    }

    #[test]
    fn quantiles_stable_across_compress() {
        let mut sketch = RttSketch::new();
        for i in 1..=1000 {
            sketch.add(i as f64, 1);
        }
        sketch.compress();
        let p90 = sketch.quantile(0.9);
        assert!((p90 - 900.0).abs() < 25.0, "p90 was {p90}");
    }
}
