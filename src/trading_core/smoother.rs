//! One-dimensional Kalman smoother for the close series
//!
//! Random-walk state model: the estimate is carried forward unchanged and
//! its variance grows by `process_variance` each step before being blended
//! with the new observation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSmoother {
    process_variance: f64,
    measurement_variance: f64,
    estimate: Option<f64>,
    error_variance: f64,
}

impl PriceSmoother {
    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            process_variance,
            measurement_variance,
            estimate: None,
            error_variance: 1.0,
        }
    }

    /// Retune the noise model; the current estimate is kept
    pub fn set_variances(&mut self, process_variance: f64, measurement_variance: f64) {
        self.process_variance = process_variance;
        self.measurement_variance = measurement_variance;
    }

    /// Fold one observation in and return the new estimate
    pub fn update(&mut self, observation: f64) -> f64 {
        let Some(x) = self.estimate else {
            self.estimate = Some(observation);
            return observation;
        };

        let p_pred = self.error_variance + self.process_variance;
        let denom = p_pred + self.measurement_variance;
        let gain = if denom > 0.0 { p_pred / denom } else { 0.0 };
        let next = x + gain * (observation - x);

        self.error_variance = (1.0 - gain) * p_pred;
        self.estimate = Some(next);
        next
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }
}

impl Default for PriceSmoother {
    fn default() -> Self {
        Self::new(0.01, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_seeds_estimate() {
        let mut s = PriceSmoother::default();
        assert!(s.estimate().is_none());
        assert_eq!(s.update(100.0), 100.0);
    }

    #[test]
    fn test_estimate_lags_a_step_change() {
        let mut s = PriceSmoother::new(0.01, 1.0);
        s.update(100.0);
        let after = s.update(110.0);
        assert!(after > 100.0 && after < 110.0);
    }

    #[test]
    fn test_converges_on_constant_input() {
        let mut s = PriceSmoother::default();
        s.update(50.0);
        for _ in 0..200 {
            s.update(60.0);
        }
        assert!((s.estimate().unwrap() - 60.0).abs() < 0.01);
    }
}
