//! Compute accounting for adaptive inference.
//!
//! [`ExpertUsage`] accumulates the per-sample expert counts of many adaptive
//! passes and reports how much expert compute the gate saved compared with
//! always running the full ensemble.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Histogram of experts evaluated per sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertUsage {
    /// `histogram[c - 1]` is the number of samples that used `c` experts.
    histogram: Vec<u64>,
}

impl ExpertUsage {
    /// Empty accounting for an ensemble of `num_experts` experts.
    pub fn new(num_experts: usize) -> Self {
        ExpertUsage { histogram: vec![0; num_experts] }
    }

    /// Ensemble size this accounting was created for.
    pub fn num_experts(&self) -> usize {
        self.histogram.len()
    }

    /// Record one batch of per-sample expert counts.
    ///
    /// The batch is rejected as a whole if any count lies outside
    /// `[1, num_experts]`.
    pub fn record<'a, I>(&mut self, counts: I) -> ModelResult<()>
    where
        I: IntoIterator<Item = &'a usize>,
    {
        let num_experts = self.num_experts();
        let counts: Vec<usize> = counts.into_iter().copied().collect();
        if let Some(&count) = counts.iter().find(|&&c| c == 0 || c > num_experts) {
            return Err(ModelError::InvalidExpertCount { count, num_experts });
        }
        for c in counts {
            self.histogram[c - 1] += 1;
        }
        Ok(())
    }

    /// Samples that used exactly `count` experts.
    pub fn samples_with(&self, count: usize) -> u64 {
        count
            .checked_sub(1)
            .and_then(|i| self.histogram.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// The raw histogram, indexed by `count - 1`.
    pub fn histogram(&self) -> &[u64] {
        &self.histogram
    }

    /// Number of samples recorded.
    pub fn total_samples(&self) -> u64 {
        self.histogram.iter().sum()
    }

    /// Mean experts per sample, `0.0` before anything is recorded.
    pub fn mean_experts(&self) -> f64 {
        let total = self.total_samples();
        if total == 0 {
            return 0.0;
        }
        let weighted: u64 = self
            .histogram
            .iter()
            .enumerate()
            .map(|(i, &n)| (i as u64 + 1) * n)
            .sum();
        weighted as f64 / total as f64
    }

    /// Fraction of expert evaluations avoided: `1 - mean / num_experts`.
    pub fn compute_savings(&self) -> f64 {
        if self.histogram.is_empty() || self.total_samples() == 0 {
            return 0.0;
        }
        1.0 - self.mean_experts() / self.num_experts() as f64
    }

    /// Add another accounting of the same ensemble size.
    pub fn merge(&mut self, other: &ExpertUsage) -> ModelResult<()> {
        if other.num_experts() != self.num_experts() {
            return Err(ModelError::shape_mismatch(
                vec![self.num_experts()],
                vec![other.num_experts()],
            ));
        }
        for (a, b) in self.histogram.iter_mut().zip(&other.histogram) {
            *a += b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_usage_reports_zero() {
        let usage = ExpertUsage::new(3);
        assert_eq!(usage.total_samples(), 0);
        assert_eq!(usage.mean_experts(), 0.0);
        assert_eq!(usage.compute_savings(), 0.0);
    }

    #[test]
    fn mean_and_savings() {
        let mut usage = ExpertUsage::new(4);
        usage.record(&[1, 1, 2, 4]).unwrap();
        assert_eq!(usage.histogram(), &[2, 1, 0, 1]);
        assert_abs_diff_eq!(usage.mean_experts(), 2.0);
        assert_abs_diff_eq!(usage.compute_savings(), 0.5);
        assert_eq!(usage.samples_with(0), 0);
        assert_eq!(usage.samples_with(1), 2);
    }

    #[test]
    fn invalid_counts_leave_usage_untouched() {
        let mut usage = ExpertUsage::new(2);
        assert!(matches!(
            usage.record(&[1, 3]),
            Err(ModelError::InvalidExpertCount { count: 3, num_experts: 2 })
        ));
        assert!(usage.record(&[0]).is_err());
        assert_eq!(usage.total_samples(), 0);
    }

    #[test]
    fn merge_requires_same_size() {
        let mut a = ExpertUsage::new(2);
        let mut b = ExpertUsage::new(2);
        a.record(&[1]).unwrap();
        b.record(&[2, 2]).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.histogram(), &[1, 2]);
        assert!(a.merge(&ExpertUsage::new(3)).is_err());
    }
}
