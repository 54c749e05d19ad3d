//! Marginal utility curves for item preferences.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Marginal utility is `U'(q) = B / (q + 1)^D`: `B` the base utility of one
/// item, `D` the diminishing factor. Each agent samples its own `B` and `D`
/// from the configured normal distributions, so preferences vary across a
/// population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityFunction {
    pub base_utility: f64,
    pub diminishing_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalParams {
    pub mean: f64,
    pub std_dev: f64,
}

fn positive_normal_sample(params: &NormalParams, rng: &mut impl Rng) -> f64 {
    let normal = match Normal::new(params.mean, params.std_dev) {
        Ok(n) => n,
        Err(_) => return params.mean.max(0.0),
    };
    loop {
        let sample = normal.sample(rng);
        if sample >= 0.0 {
            return sample;
        }
    }
}

impl UtilityFunction {
    pub fn sample(base: &NormalParams, diminishing: &NormalParams, rng: &mut impl Rng) -> Self {
        Self {
            base_utility: positive_normal_sample(base, rng),
            diminishing_factor: positive_normal_sample(diminishing, rng),
        }
    }

    pub fn marginal_utility(&self, quantity: f64) -> f64 {
        self.base_utility / (quantity + 1.0).powf(self.diminishing_factor)
    }

    /// Total utility from holding `quantity`, using the closed-form integral
    /// of the marginal curve (the discrete sum is too slow for large
    /// holdings): `B*ln(q) + B` when `D == 1`, otherwise
    /// `B*(q^(1-D) - 1)/(1-D) + B`.
    pub fn total_utility(&self, quantity: f64) -> f64 {
        if quantity == 0.0 {
            return 0.0;
        }
        let b = self.base_utility;
        let d = self.diminishing_factor;
        if (d - 1.0).abs() < f64::EPSILON {
            b * quantity.ln() + b
        } else {
            (b * (quantity.powf(1.0 - d) - 1.0)) / (1.0 - d) + b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marginal_utility_diminishes() {
        let f = UtilityFunction { base_utility: 100.0, diminishing_factor: 1.5 };
        assert!(f.marginal_utility(0.0) > f.marginal_utility(1.0));
        assert!(f.marginal_utility(1.0) > f.marginal_utility(10.0));
        assert_eq!(f.marginal_utility(0.0), 100.0);
    }

    #[test]
    fn test_total_utility_zero_holding() {
        let f = UtilityFunction { base_utility: 50.0, diminishing_factor: 1.0 };
        assert_eq!(f.total_utility(0.0), 0.0);
        // At q=1 both branches reduce to B.
        assert!((f.total_utility(1.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_sampled_parameters_non_negative() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let f = UtilityFunction::sample(
                &NormalParams { mean: 10.0, std_dev: 5.0 },
                &NormalParams { mean: 1.0, std_dev: 0.5 },
                &mut rng,
            );
            assert!(f.base_utility >= 0.0);
            assert!(f.diminishing_factor >= 0.0);
        }
    }
}
