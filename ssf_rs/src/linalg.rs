//! Dense linear-algebra helpers shared by the filter and the smoothers.
//!
//! Everything here works on `nalgebra` dynamic matrices. The view helpers
//! exist so that owned buffers can be handed to the structural operators of
//! `Dynamics` / `Loading`, which take views so that composite systems can
//! delegate to their blocks on sub-views without copying.

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector, DVectorView, DVectorViewMut};

use crate::error::{Result, SsfError};

/// Above this state dimension the Lyapunov equation is solved by doubling
/// instead of the n²×n² Kronecker system.
const KRONECKER_MAX_DIM: usize = 30;
const DOUBLING_MAX_ITER: usize = 100;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

pub fn vview(x: &DVector<f64>) -> DVectorView<'_, f64> {
    x.rows(0, x.nrows())
}

pub fn vmut(x: &mut DVector<f64>) -> DVectorViewMut<'_, f64> {
    let n = x.nrows();
    x.rows_mut(0, n)
}

pub fn mview(m: &DMatrix<f64>) -> DMatrixView<'_, f64> {
    m.view((0, 0), m.shape())
}

pub fn mmut(m: &mut DMatrix<f64>) -> DMatrixViewMut<'_, f64> {
    let shape = m.shape();
    m.view_mut((0, 0), shape)
}

// ---------------------------------------------------------------------------
// Compensated summation
// ---------------------------------------------------------------------------

/// Neumaier's variant of Kahan summation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NeumaierSum {
    sum: f64,
    compensation: f64,
}

impl NeumaierSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }

    pub fn scale(&mut self, factor: f64) {
        self.sum *= factor;
        self.compensation *= factor;
    }
}

/// Compensated dot product of two equally long sequences.
pub fn compensated_dot<'a, 'b, I, J>(a: I, b: J) -> f64
where
    I: IntoIterator<Item = &'a f64>,
    J: IntoIterator<Item = &'b f64>,
{
    let mut acc = NeumaierSum::new();
    for (x, y) in a.into_iter().zip(b) {
        acc.push(x * y);
    }
    acc.value()
}

/// Compensated sum of a sequence.
pub fn compensated_sum<'a, I>(a: I) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut acc = NeumaierSum::new();
    for x in a {
        acc.push(*x);
    }
    acc.value()
}

// ---------------------------------------------------------------------------
// Symmetric matrices
// ---------------------------------------------------------------------------

/// Replace `m` by (m + m') / 2.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = v;
            m[(j, i)] = v;
        }
    }
}

/// Zero the diagonal entries in [-tol, 0) left behind by rounding.
pub fn clean_diagonal(m: &mut DMatrix<f64>, tol: f64) {
    for i in 0..m.nrows().min(m.ncols()) {
        let v = m[(i, i)];
        if v < 0.0 && v >= -tol {
            m[(i, i)] = 0.0;
        }
    }
}

/// Lower-triangular L with L·L' = A·A', diagonal non-negative.
///
/// `A` is n×k with any k; the result is always n×n.
pub fn triangularize(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let mut l = DMatrix::zeros(n, n);
    if a.ncols() == 0 || n == 0 {
        return l;
    }
    // A' = Q·R  =>  A·A' = R'·R
    let r = a.transpose().qr().r();
    for i in 0..r.nrows().min(n) {
        let sign = if r[(i, i)] < 0.0 { -1.0 } else { 1.0 };
        for j in i..n {
            l[(j, i)] = sign * r[(i, j)];
        }
    }
    l
}

/// Cholesky factor of a positive semi-definite matrix.
///
/// Pivots within `tol` (relative to the largest diagonal entry) of zero give
/// a zero column instead of a failure.
pub fn cholesky_psd(p: &DMatrix<f64>, tol: f64) -> Result<DMatrix<f64>> {
    let n = p.nrows();
    if p.ncols() != n {
        return Err(SsfError::DimensionMismatch {
            expected: n,
            got: p.ncols(),
        });
    }
    let scale = (0..n).map(|i| p[(i, i)].abs()).fold(1.0_f64, f64::max);
    let eps = tol * scale;
    let mut l = DMatrix::zeros(n, n);
    for j in 0..n {
        let d = p[(j, j)] - compensated_dot(l.row(j).iter().take(j), l.row(j).iter().take(j));
        if d > eps {
            let ljj = d.sqrt();
            l[(j, j)] = ljj;
            for i in (j + 1)..n {
                let s = compensated_dot(l.row(i).iter().take(j), l.row(j).iter().take(j));
                l[(i, j)] = (p[(i, j)] - s) / ljj;
            }
        } else if d < -eps {
            return Err(SsfError::SingularSystem(format!(
                "matrix is not positive semi-definite (pivot {} = {:e})",
                j, d
            )));
        }
    }
    Ok(l)
}

/// Whether `p` is symmetric positive semi-definite up to `tol`.
pub fn is_psd(p: &DMatrix<f64>, tol: f64) -> bool {
    if !p.is_square() || p.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let scale = p.amax().max(1.0);
    for i in 0..p.nrows() {
        for j in (i + 1)..p.ncols() {
            if (p[(i, j)] - p[(j, i)]).abs() > tol * scale {
                return false;
            }
        }
    }
    cholesky_psd(p, tol).is_ok()
}

// ---------------------------------------------------------------------------
// Diffuse factor reduction
// ---------------------------------------------------------------------------

/// Remove the direction revealed by an informative observation from the
/// diffuse factor.
///
/// With `zb = Z·B` (length d) and `Pi = B·B'`, returns the n×(d-1) factor of
/// `Pi - B·zb·zb'·B' / |zb|²`. A Householder reflection H with `zb'·H ∝ e1`
/// rotates the factor so that the first column of `B·H` carries all of the
/// observed direction; that column is dropped.
pub fn reduce_factor(b: &DMatrix<f64>, zb: &DVector<f64>) -> DMatrix<f64> {
    let d = b.ncols();
    let norm = zb.norm();
    if d == 0 || norm == 0.0 {
        return b.clone();
    }
    let alpha = if zb[0] >= 0.0 { -norm } else { norm };
    let mut v = zb.clone();
    v[0] -= alpha;
    let vv = v.norm_squared();
    let mut bh = b.clone();
    if vv > 0.0 {
        let bv = b * &v;
        bh.ger(-2.0 / vv, &bv, &v, 1.0);
    }
    bh.remove_column(0)
}

// ---------------------------------------------------------------------------
// Lyapunov equation
// ---------------------------------------------------------------------------

/// Solve P = T·P·T' + V for the stationary covariance.
pub fn stationary_covariance(t: &DMatrix<f64>, v: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = t.nrows();
    if !t.is_square() || v.shape() != (n, n) {
        return Err(SsfError::DimensionMismatch {
            expected: n,
            got: v.nrows(),
        });
    }
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    let mut p = if n <= KRONECKER_MAX_DIM {
        lyapunov_kronecker(t, v)?
    } else {
        lyapunov_doubling(t, v)?
    };
    symmetrize(&mut p);
    let tol = 1e-9 * p.amax().max(1.0);
    if (0..n).any(|i| !p[(i, i)].is_finite() || p[(i, i)] < -tol) {
        return Err(SsfError::SingularSystem(
            "dynamics are not stationary".to_string(),
        ));
    }
    Ok(p)
}

fn lyapunov_kronecker(t: &DMatrix<f64>, v: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = t.nrows();
    // vec(T·P·T') = (T ⊗ T)·vec(P) in column-major order
    let a = DMatrix::<f64>::identity(n * n, n * n) - t.kronecker(t);
    let rhs = DVector::from_column_slice(v.as_slice());
    let sol = a.lu().solve(&rhs).ok_or_else(|| {
        SsfError::SingularSystem("Lyapunov system is singular (unit root)".to_string())
    })?;
    Ok(DMatrix::from_column_slice(n, n, sol.as_slice()))
}

fn lyapunov_doubling(t: &DMatrix<f64>, v: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let mut p = v.clone();
    let mut a = t.clone();
    for _ in 0..DOUBLING_MAX_ITER {
        let inc = &a * &p * a.transpose();
        p += &inc;
        a = &a * &a;
        if a.amax() < 1e-15 || inc.amax() <= 1e-15 * p.amax().max(1.0) {
            return Ok(p);
        }
        if !a.amax().is_finite() {
            break;
        }
    }
    Err(SsfError::SingularSystem(
        "Lyapunov doubling did not converge".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_neumaier_beats_naive() {
        let values = [1.0, 1e100, 1.0, -1e100];
        let mut acc = NeumaierSum::new();
        for v in values {
            acc.push(v);
        }
        assert_abs_diff_eq!(acc.value(), 2.0);
        assert_abs_diff_eq!(compensated_sum(values.iter()), 2.0);
    }

    #[test]
    fn test_compensated_dot() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, -5.0, 6.0];
        assert_abs_diff_eq!(compensated_dot(a.iter(), b.iter()), 12.0);
    }

    #[test]
    fn test_triangularize_reproduces_product() {
        let a = DMatrix::from_row_slice(3, 4, &[
            1.0, 2.0, 0.5, -1.0,
            0.0, 3.0, 1.0, 2.0,
            -2.0, 1.0, 4.0, 0.0,
        ]);
        let l = triangularize(&a);
        let lhs = &l * l.transpose();
        let rhs = &a * a.transpose();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
        for i in 0..3 {
            assert!(l[(i, i)] >= 0.0);
            for j in (i + 1)..3 {
                assert_eq!(l[(i, j)], 0.0);
            }
        }
    }

    #[test]
    fn test_triangularize_narrow() {
        let a = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]);
        let l = triangularize(&a);
        assert_eq!(l.shape(), (3, 3));
        assert_abs_diff_eq!(&l * l.transpose(), &a * a.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_psd_singular() {
        // rank one: [1 2; 2 4]
        let p = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let l = cholesky_psd(&p, 1e-12).unwrap();
        assert_abs_diff_eq!(&l * l.transpose(), p, epsilon = 1e-12);
        assert_abs_diff_eq!(l[(1, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let p = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let err = cholesky_psd(&p, 1e-12).unwrap_err();
        assert!(err.is_singular());
        assert!(!is_psd(&p, 1e-12));
    }

    #[test]
    fn test_reduce_factor_removes_observed_direction() {
        let b = DMatrix::<f64>::identity(3, 3);
        let z = DVector::from_vec(vec![1.0, 1.0, 0.0]);
        let zb = b.tr_mul(&z);
        let reduced = reduce_factor(&b, &zb);
        assert_eq!(reduced.ncols(), 2);

        let pi = &b * b.transpose();
        let mi = &pi * &z;
        let fi = z.dot(&mi);
        let expected = &pi - &mi * mi.transpose() / fi;
        assert_abs_diff_eq!(&reduced * reduced.transpose(), expected, epsilon = 1e-12);
        // the remaining factor is invisible to Z
        assert_abs_diff_eq!(reduced.tr_mul(&z).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stationary_ar1() {
        let t = DMatrix::from_element(1, 1, 0.9);
        let v = DMatrix::from_element(1, 1, 1.0);
        let p = stationary_covariance(&t, &v).unwrap();
        assert_abs_diff_eq!(p[(0, 0)], 1.0 / (1.0 - 0.81), epsilon = 1e-10);
    }

    #[test]
    fn test_stationary_matches_doubling() {
        let t = DMatrix::from_row_slice(2, 2, &[0.5, 0.3, -0.2, 0.4]);
        let v = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 0.5]);
        let p1 = lyapunov_kronecker(&t, &v).unwrap();
        let p2 = lyapunov_doubling(&t, &v).unwrap();
        assert_abs_diff_eq!(p1, p2, epsilon = 1e-10);
        let fixed = &t * &p1 * t.transpose() + &v;
        assert_abs_diff_eq!(fixed, p1, epsilon = 1e-10);
    }

    #[test]
    fn test_stationary_unit_root_fails() {
        let t = DMatrix::from_element(1, 1, 1.0);
        let v = DMatrix::from_element(1, 1, 1.0);
        assert!(stationary_covariance(&t, &v).is_err());

        let t = DMatrix::from_element(1, 1, 1.5);
        assert!(stationary_covariance(&t, &v).is_err());
    }
}
