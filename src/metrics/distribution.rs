//! Mergeable sufficient-statistics summary of sampled values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Count, extremes and the first two power sums of a set of samples.
///
/// Extending with a value and merging with another distribution are both
/// exact, so the result never depends on the order samples arrive in or on
/// how clients pre-aggregated them. A `Distribution` always has `n > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Distribution {
    n: f64,
    min: f64,
    max: f64,
    sum: f64,
    sum_sq: f64,
}

impl Distribution {
    pub fn from_value(v: f64) -> Self {
        Distribution {
            n: 1.0,
            min: v,
            max: v,
            sum: v,
            sum_sq: v * v,
        }
    }

    /// Build from the wire 5-tuple `[N, Min, Max, Sum, SumSq]`.
    ///
    /// Returns `None` for a zero or negative weight, or any non-finite component.
    pub fn from_array(parts: [f64; 5]) -> Option<Self> {
        let [n, min, max, sum, sum_sq] = parts;
        if !parts.iter().all(|p| p.is_finite()) || n <= 0.0 || min > max {
            return None;
        }
        Some(Distribution {
            n,
            min,
            max,
            sum,
            sum_sq,
        })
    }

    pub fn to_array(&self) -> [f64; 5] {
        [self.n, self.min, self.max, self.sum, self.sum_sq]
    }

    pub fn add_entry(&mut self, v: f64) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.sum += v;
        self.sum_sq += v * v;
        self.n += 1.0;
    }

    pub fn merge(&mut self, other: &Distribution) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.n += other.n;
    }

    pub fn count(&self) -> f64 {
        self.n
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_sq(&self) -> f64 {
        self.sum_sq
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.n
    }

    /// Population standard deviation.
    ///
    /// The radicand is clamped at zero: `E[x²] - E[x]²` can come out slightly
    /// negative through floating-point cancellation.
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        (self.sum_sq / self.n - mean * mean).max(0.0).sqrt()
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Distribution: mean: {:.5}, sd: {:.5}, min/max: {:.5}/{:.5} (weight {})",
            self.mean(),
            self.std_dev(),
            self.min,
            self.max,
            self.n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn assert_close(a: &Distribution, b: &Distribution) {
        let (a, b) = (a.to_array(), b.to_array());
        for (x, y) in a.iter().zip(b.iter()) {
            let tolerance = 1e-9 * x.abs().max(y.abs()).max(1.0);
            assert!((x - y).abs() <= tolerance, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_add_entry() {
        let mut d = Distribution::from_value(1.0);
        d.add_entry(3.0);
        d.add_entry(5.0);

        assert_eq!(d.mean(), 3.0);
        assert_eq!(d.min(), 1.0);
        assert_eq!(d.max(), 5.0);
        assert_eq!(d.count(), 3.0);
        assert_eq!(d.sum_sq(), 35.0);
    }

    #[test]
    fn test_merge_two_distributions() {
        let mut d = Distribution::from_array([3.0, 1.0, 5.0, 9.0, 35.0]).unwrap();
        let d2 = Distribution::from_array([3.0, 1.0, 5.0, 9.0, 35.0]).unwrap();

        d.merge(&d2);

        assert_eq!(d.mean(), 3.0);
        assert_eq!(d.min(), 1.0);
        assert_eq!(d.max(), 5.0);
        assert_eq!(d.count(), 6.0);
    }

    #[test]
    fn test_from_array_rejects_empty_and_non_finite() {
        assert!(Distribution::from_array([0.0, 1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(Distribution::from_array([-2.0, 1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(Distribution::from_array([1.0, f64::NAN, 1.0, 1.0, 1.0]).is_none());
        assert!(Distribution::from_array([1.0, 1.0, f64::INFINITY, 1.0, 1.0]).is_none());
        assert!(Distribution::from_array([2.0, 5.0, 1.0, 6.0, 26.0]).is_none());
    }

    #[test]
    fn test_std_dev() {
        let mut d = Distribution::from_value(2.0);
        for v in [4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            d.add_entry(v);
        }
        assert!((d.std_dev() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_std_dev_never_nan_under_cancellation() {
        let mut d = Distribution::from_value(1e9 + 0.1);
        for _ in 0..1000 {
            d.add_entry(1e9 + 0.1);
        }
        let sd = d.std_dev();
        assert!(sd.is_finite());
        assert!(sd >= 0.0);
    }

    #[test]
    fn test_singletons_merged_equal_sequential_entries() {
        let samples = [3.5, -1.0, 42.0, 0.25, 7.0, 7.0, 19.5];

        let mut sequential = Distribution::from_value(samples[0]);
        for v in &samples[1..] {
            sequential.add_entry(*v);
        }

        // Pairwise tree of singleton merges.
        let mut layer: Vec<Distribution> =
            samples.iter().map(|v| Distribution::from_value(*v)).collect();
        while layer.len() > 1 {
            layer = layer
                .chunks(2)
                .map(|pair| {
                    let mut d = pair[0];
                    if let Some(other) = pair.get(1) {
                        d.merge(other);
                    }
                    d
                })
                .collect();
        }

        assert_close(&sequential, &layer[0]);
    }

    #[test]
    fn test_merge_order_and_grouping_independent() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let samples: Vec<f64> = (0..200).map(|_| rng.gen_range(-1000.0..1000.0)).collect();

        let mut reference = Distribution::from_value(samples[0]);
        for v in &samples[1..] {
            reference.add_entry(*v);
        }

        for _ in 0..20 {
            let mut shuffled = samples.clone();
            shuffled.shuffle(&mut rng);

            // Random partition into pre-aggregated groups, merged in random order.
            let mut groups = Vec::new();
            let mut rest = shuffled.as_slice();
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(17));
                let (head, tail) = rest.split_at(take);
                let mut d = Distribution::from_value(head[0]);
                for v in &head[1..] {
                    d.add_entry(*v);
                }
                groups.push(d);
                rest = tail;
            }
            groups.shuffle(&mut rng);

            let mut merged = groups[0];
            for g in &groups[1..] {
                merged.merge(g);
            }
            assert_close(&reference, &merged);
        }
    }
}
