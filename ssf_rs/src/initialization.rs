use nalgebra::{DMatrix, DVector};

use crate::dynamics::Dynamics;
use crate::error::{Result, SsfError};
use crate::linalg::{is_psd, stationary_covariance};

/// Initial state distribution: a_0, the proper covariance Pf0 and the
/// diffuse constraint B (n×d) with Pi0 = B·B'.
#[derive(Debug, Clone, PartialEq)]
pub struct Initialization {
    pub a0: DVector<f64>,
    pub pf0: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

impl Initialization {
    /// Known mean and covariance, no diffuse part.
    pub fn proper(a0: DVector<f64>, pf0: DMatrix<f64>) -> Self {
        let n = a0.nrows();
        Self {
            a0,
            pf0,
            b: DMatrix::zeros(n, 0),
        }
    }

    /// a_0 = 0, Pf0 = 0, d = 0.
    pub fn zero(n: usize) -> Self {
        Self::proper(DVector::zeros(n), DMatrix::zeros(n, n))
    }

    /// Fully diffuse: a_0 = 0, Pf0 = 0, B = I.
    pub fn diffuse(n: usize) -> Self {
        Self {
            a0: DVector::zeros(n),
            pf0: DMatrix::zeros(n, n),
            b: DMatrix::identity(n, n),
        }
    }

    pub fn with_diffuse(mut self, b: DMatrix<f64>) -> Self {
        self.b = b;
        self
    }

    /// Zero mean and the unconditional covariance P = T·P·T' + V.
    ///
    /// Fails with `SingularSystem` when the dynamics have a unit root.
    pub fn stationary(dynamics: &dyn Dynamics) -> Result<Self> {
        let n = dynamics.dim();
        let pf0 = stationary_covariance(&dynamics.transition(0), &dynamics.innovation_var(0))?;
        Ok(Self::proper(DVector::zeros(n), pf0))
    }

    /// Direct sum of independent initializations.
    pub fn block_diagonal(parts: &[Initialization]) -> Self {
        let n: usize = parts.iter().map(|p| p.dim()).sum();
        let d: usize = parts.iter().map(|p| p.diffuse_dim()).sum();
        let mut a0 = DVector::zeros(n);
        let mut pf0 = DMatrix::zeros(n, n);
        let mut b = DMatrix::zeros(n, d);
        let (mut row, mut col) = (0, 0);
        for p in parts {
            let (ni, di) = (p.dim(), p.diffuse_dim());
            a0.rows_mut(row, ni).copy_from(&p.a0);
            pf0.view_mut((row, row), (ni, ni)).copy_from(&p.pf0);
            if di > 0 {
                b.view_mut((row, col), (ni, di)).copy_from(&p.b);
            }
            row += ni;
            col += di;
        }
        Self { a0, pf0, b }
    }

    pub fn dim(&self) -> usize {
        self.a0.nrows()
    }

    pub fn diffuse_dim(&self) -> usize {
        self.b.ncols()
    }

    pub fn is_diffuse(&self) -> bool {
        self.diffuse_dim() > 0
    }

    /// Pi0 = B·B'
    pub fn pi0(&self) -> DMatrix<f64> {
        &self.b * self.b.transpose()
    }

    pub fn is_valid(&self) -> bool {
        let n = self.dim();
        self.pf0.shape() == (n, n)
            && self.b.nrows() == n
            && self.diffuse_dim() <= n
            && self.a0.iter().all(|x| x.is_finite())
            && self.b.iter().all(|x| x.is_finite())
            && is_psd(&self.pf0, 1e-9)
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.dim();
        if self.pf0.shape() != (n, n) {
            return Err(SsfError::DimensionMismatch {
                expected: n,
                got: self.pf0.nrows(),
            });
        }
        if self.b.nrows() != n {
            return Err(SsfError::DimensionMismatch {
                expected: n,
                got: self.b.nrows(),
            });
        }
        if self.diffuse_dim() > n {
            return Err(SsfError::InvalidSystem(format!(
                "diffuse dimension {} exceeds state dimension {}",
                self.diffuse_dim(),
                n
            )));
        }
        if !self.is_valid() {
            return Err(SsfError::InvalidSystem(
                "initial covariance is not positive semi-definite".to_string(),
            ));
        }
        Ok(())
    }

    /// Large-variance approximation of the diffuse part:
    /// Pf0 + kappa·B·B', no exact diffuse dimension left.
    pub fn approximate_diffuse(&self, kappa: f64) -> Self {
        let mut pf0 = self.pf0.clone();
        if self.is_diffuse() {
            pf0 += self.pi0() * kappa;
        }
        Self::proper(self.a0.clone(), pf0)
    }

    /// Default kappa for the approximate diffuse initialization.
    pub fn default_kappa() -> f64 {
        1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{Ar1Dynamics, MatrixDynamics, RandomWalkDynamics};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_approximate_diffuse_basic() {
        let init = Initialization::diffuse(2).approximate_diffuse(1e6);

        assert_eq!(init.dim(), 2);
        assert_eq!(init.diffuse_dim(), 0);
        assert_abs_diff_eq!(init.a0[0], 0.0);
        assert_abs_diff_eq!(init.pf0[(0, 0)], 1e6, epsilon = 1e-4);
        assert_abs_diff_eq!(init.pf0[(0, 1)], 0.0);
        assert_abs_diff_eq!(init.pf0[(1, 1)], 1e6, epsilon = 1e-4);
    }

    #[test]
    fn test_approximate_keeps_proper_part() {
        let pf0 = DMatrix::from_element(1, 1, 2.0);
        let init = Initialization::proper(DVector::zeros(1), pf0);
        let approx = init.approximate_diffuse(1e6);
        assert_abs_diff_eq!(approx.pf0[(0, 0)], 2.0);
    }

    #[test]
    fn test_default_kappa() {
        assert_abs_diff_eq!(Initialization::default_kappa(), 1e6);
    }

    #[test]
    fn test_stationary_ar1() {
        let init = Initialization::stationary(&Ar1Dynamics::new(0.9, 1.0)).unwrap();
        assert_abs_diff_eq!(init.pf0[(0, 0)], 1.0 / 0.19, epsilon = 1e-10);
        assert!(!init.is_diffuse());
    }

    #[test]
    fn test_stationary_random_walk_is_singular() {
        let err = Initialization::stationary(&RandomWalkDynamics::new(1.0)).unwrap_err();
        assert!(err.is_singular());
    }

    #[test]
    fn test_stationary_var1() {
        let t = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.2, 0.3]);
        let s = DMatrix::identity(2, 2);
        let d = MatrixDynamics::new(t.clone(), s).unwrap();
        let init = Initialization::stationary(&d).unwrap();
        let fixed = &t * &init.pf0 * t.transpose() + DMatrix::identity(2, 2);
        assert_abs_diff_eq!(fixed, init.pf0, epsilon = 1e-10);
    }

    #[test]
    fn test_block_diagonal() {
        let parts = [
            Initialization::proper(
                DVector::from_element(1, 3.0),
                DMatrix::from_element(1, 1, 2.0),
            ),
            Initialization::diffuse(2),
        ];
        let init = Initialization::block_diagonal(&parts);
        assert_eq!(init.dim(), 3);
        assert_eq!(init.diffuse_dim(), 2);
        assert_abs_diff_eq!(init.a0[0], 3.0);
        assert_abs_diff_eq!(init.pf0[(0, 0)], 2.0);
        let pi0 = init.pi0();
        assert_abs_diff_eq!(pi0[(0, 0)], 0.0);
        assert_abs_diff_eq!(pi0[(1, 1)], 1.0);
        assert_abs_diff_eq!(pi0[(2, 2)], 1.0);
        assert!(init.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_too_many_diffuse_columns() {
        let init = Initialization::zero(1).with_diffuse(DMatrix::identity(1, 2));
        assert!(matches!(init.validate(), Err(SsfError::InvalidSystem(_))));
    }
}
