use std::f64::consts::PI;

use crate::linalg::NeumaierSum;

/// Accumulated diffuse log-likelihood.
///
///   ll = -1/2 * (n·ln(2π) + Σ ln F_t + Σ e_t²/F_t + Σ ln F∞_t)
///
/// where the first two sums run over the n ordinary observations and the
/// last one over the diffuse (informative) steps.
///
/// Concentrating out the scale:
///   sigma2 = Σ e_t²/F_t / n
///   ll_c   = -1/2 * (n·ln(2π) + n·ln(sigma2) + n + Σ ln F_t + Σ ln F∞_t)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiffuseLikelihood {
    log_f: NeumaierSum,
    ssq: NeumaierSum,
    log_fi: NeumaierSum,
    n_obs: usize,
    n_diffuse: usize,
}

impl DiffuseLikelihood {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ordinary(&mut self, e: f64, f: f64) {
        self.log_f.push(f.ln());
        self.ssq.push(e * e / f);
        self.n_obs += 1;
    }

    pub fn add_diffuse(&mut self, fi: f64) {
        self.log_fi.push(fi.ln());
        self.n_diffuse += 1;
    }

    /// Number of ordinary observations.
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    /// Number of informative diffuse steps.
    pub fn n_diffuse(&self) -> usize {
        self.n_diffuse
    }

    pub fn sum_log_f(&self) -> f64 {
        self.log_f.value()
    }

    pub fn ssq(&self) -> f64 {
        self.ssq.value()
    }

    pub fn sum_log_fi(&self) -> f64 {
        self.log_fi.value()
    }

    pub fn loglikelihood(&self) -> f64 {
        let n = self.n_obs as f64;
        -0.5 * (n * (2.0 * PI).ln() + self.sum_log_f() + self.ssq() + self.sum_log_fi())
    }

    /// Maximum-likelihood scale; NaN without ordinary observations.
    pub fn sigma2(&self) -> f64 {
        if self.n_obs == 0 {
            return f64::NAN;
        }
        self.ssq() / self.n_obs as f64
    }

    pub fn concentrated_loglikelihood(&self) -> f64 {
        if self.n_obs == 0 {
            return -0.5 * self.sum_log_fi();
        }
        let n = self.n_obs as f64;
        -0.5 * (n * (2.0 * PI).ln()
            + n * self.sigma2().ln()
            + n
            + self.sum_log_f()
            + self.sum_log_fi())
    }

    /// Correct for observations that were divided by `factor` before filtering.
    pub fn rescale(&mut self, factor: f64) {
        // F scales with factor², e²/F is invariant
        self.log_f.push(2.0 * self.n_obs as f64 * factor.ln());
    }
}

/// Contribution of one ordinary step, without the 2π constant.
pub fn ordinary_contribution(e: f64, f: f64) -> f64 {
    -0.5 * (f.ln() + e * e / f)
}

/// Contribution of one informative diffuse step.
pub fn diffuse_contribution(fi: f64) -> f64 {
    -0.5 * fi.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_gaussian_loglikelihood() {
        // iid N(0, 2): ll = Σ -1/2 (ln 2π + ln 2 + y²/2)
        let ys = [0.5, -1.0, 2.0];
        let mut lik = DiffuseLikelihood::new();
        for y in ys {
            lik.add_ordinary(y, 2.0);
        }
        let expected: f64 = ys
            .iter()
            .map(|y| -0.5 * ((2.0 * PI).ln() + 2.0_f64.ln() + y * y / 2.0))
            .sum();
        assert_abs_diff_eq!(lik.loglikelihood(), expected, epsilon = 1e-12);
        assert_eq!(lik.n_obs(), 3);
    }

    #[test]
    fn test_concentrated_at_sigma2_hat() {
        let mut lik = DiffuseLikelihood::new();
        lik.add_diffuse(4.0);
        for (e, f) in [(1.0, 1.0), (-2.0, 2.0), (0.5, 1.5)] {
            lik.add_ordinary(e, f);
        }
        let s2 = lik.sigma2();
        assert_abs_diff_eq!(s2, (1.0 + 2.0 + 0.25 / 1.5) / 3.0, epsilon = 1e-12);

        // concentrated = full likelihood evaluated with F scaled by sigma2
        let mut scaled = DiffuseLikelihood::new();
        scaled.add_diffuse(4.0);
        for (e, f) in [(1.0, 1.0), (-2.0, 2.0), (0.5, 1.5)] {
            scaled.add_ordinary(e, f * s2);
        }
        assert_abs_diff_eq!(
            lik.concentrated_loglikelihood(),
            scaled.loglikelihood(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_no_observations() {
        let lik = DiffuseLikelihood::new();
        assert!(lik.sigma2().is_nan());
        assert_abs_diff_eq!(lik.loglikelihood(), 0.0);
    }

    #[test]
    fn test_contributions_sum_to_loglikelihood() {
        let steps = [(0.3, 1.2), (-0.7, 0.9)];
        let mut lik = DiffuseLikelihood::new();
        lik.add_diffuse(2.5);
        let mut total = diffuse_contribution(2.5);
        for (e, f) in steps {
            lik.add_ordinary(e, f);
            total += ordinary_contribution(e, f);
        }
        let constant = -0.5 * 2.0 * (2.0 * PI).ln();
        assert_abs_diff_eq!(lik.loglikelihood(), total + constant, epsilon = 1e-12);
    }
}
