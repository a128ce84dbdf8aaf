use serde::{Deserialize, Serialize};

/// Running mean and variance using Welford's algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelfordStat {
    pub count: u64,
    pub running_mean: f64,
    pub running_variance: f64,
}

impl WelfordStat {
    pub fn increment(&mut self, samples: &[f32]) {
        for &sample in samples {
            let sample = sample as f64;
            self.count += 1;
            let delta = sample - self.running_mean;
            self.running_mean += delta / self.count as f64;
            self.running_variance += delta * (sample - self.running_mean);
        }
    }

    pub fn mean(&self) -> f64 {
        self.running_mean
    }

    /// Sample standard deviation, or 1 until there is enough data to estimate one.
    pub fn std(&self) -> f64 {
        if self.count < 2 || self.running_variance <= 0. {
            return 1.;
        }
        (self.running_variance / (self.count - 1) as f64).sqrt()
    }
}

/// Sum and count of a metric. NaN samples are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AvgTracker {
    total: f64,
    count: u64,
}

impl AvgTracker {
    pub fn add(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.total += value;
        self.count += 1;
    }

    /// `None` while no sample has been recorded.
    pub fn get(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_sample_std() {
        let mut stat = WelfordStat::default();
        assert_eq!(stat.std(), 1.);
        stat.increment(&[2., 4., 4., 4., 5., 5., 7., 9.]);
        assert!((stat.mean() - 5.).abs() < 1e-9);
        // sample variance of the set above is 32 / 7
        assert!((stat.std() - (32f64 / 7.).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn constant_samples_fall_back_to_unit_std() {
        let mut stat = WelfordStat::default();
        stat.increment(&[3., 3., 3.]);
        assert_eq!(stat.std(), 1.);
    }

    #[test]
    fn avg_tracker_skips_nan() {
        let mut avg = AvgTracker::default();
        assert_eq!(avg.get(), None);
        avg.add(1.);
        avg.add(f64::NAN);
        avg.add(3.);
        assert_eq!(avg.get(), Some(2.));
    }
}
