//! Measurement loadings: the row vector Z(t) of y_t = Z(t)·a_t + e_t.
//!
//! Most loadings used in practice are structural (a single coordinate, the
//! sum of a range, a regression row) and never need Z as a vector.

use std::fmt;

use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView, DVectorViewMut};

use crate::error::{Result, SsfError};
use crate::linalg::{compensated_dot, compensated_sum, NeumaierSum};

pub trait Loading: Send + Sync + fmt::Debug {
    /// State dimension the loading applies to.
    fn dim(&self) -> usize;

    fn is_time_invariant(&self) -> bool;

    /// Z(pos)·x
    fn zx(&self, pos: usize, x: DVectorView<'_, f64>) -> f64;

    /// x <- x + d·Z(pos)'
    fn xpz(&self, pos: usize, x: DVectorViewMut<'_, f64>, d: f64);

    /// out_j = Z(pos)·M[:, j]. For a symmetric M this is M·Z'.
    fn zm(&self, pos: usize, m: DMatrixView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        for j in 0..m.ncols() {
            out[j] = self.zx(pos, m.column(j));
        }
    }

    /// Z(pos)·V·Z'
    fn zvz(&self, pos: usize, v: DMatrixView<'_, f64>) -> f64 {
        let mut vz = DVector::zeros(v.nrows());
        self.zm(pos, v, vz.rows_mut(0, v.nrows()));
        self.zx(pos, vz.rows(0, v.nrows()))
    }

    /// Materialized Z(pos).
    fn row(&self, pos: usize) -> DVector<f64> {
        let mut z = DVector::zeros(self.dim());
        let n = z.nrows();
        self.xpz(pos, z.rows_mut(0, n), 1.0);
        z
    }
}

/// Constant loading vector.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLoading {
    z: DVector<f64>,
}

impl DenseLoading {
    pub fn new(z: DVector<f64>) -> Self {
        Self { z }
    }

    pub fn from_slice(z: &[f64]) -> Self {
        Self::new(DVector::from_column_slice(z))
    }
}

impl Loading for DenseLoading {
    fn dim(&self) -> usize {
        self.z.nrows()
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn zx(&self, _pos: usize, x: DVectorView<'_, f64>) -> f64 {
        compensated_dot(self.z.iter(), x.iter())
    }

    fn xpz(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>, d: f64) {
        x.axpy(d, &self.z, 1.0);
    }

    fn row(&self, _pos: usize) -> DVector<f64> {
        self.z.clone()
    }
}

/// Z = e_index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateLoading {
    index: usize,
    dim: usize,
}

impl CoordinateLoading {
    pub fn new(index: usize, dim: usize) -> Result<Self> {
        if index >= dim {
            return Err(SsfError::DimensionMismatch {
                expected: dim,
                got: index + 1,
            });
        }
        Ok(Self { index, dim })
    }
}

impl Loading for CoordinateLoading {
    fn dim(&self) -> usize {
        self.dim
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn zx(&self, _pos: usize, x: DVectorView<'_, f64>) -> f64 {
        x[self.index]
    }

    fn xpz(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>, d: f64) {
        x[self.index] += d;
    }

    fn zm(&self, _pos: usize, m: DMatrixView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        for j in 0..m.ncols() {
            out[j] = m[(self.index, j)];
        }
    }

    fn zvz(&self, _pos: usize, v: DMatrixView<'_, f64>) -> f64 {
        v[(self.index, self.index)]
    }
}

/// Sum of the coordinates start..start+len.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumLoading {
    start: usize,
    len: usize,
    dim: usize,
}

impl SumLoading {
    pub fn new(start: usize, len: usize, dim: usize) -> Result<Self> {
        if start + len > dim {
            return Err(SsfError::DimensionMismatch {
                expected: dim,
                got: start + len,
            });
        }
        Ok(Self { start, len, dim })
    }

    /// Sum of the first `len` coordinates.
    pub fn first(len: usize, dim: usize) -> Result<Self> {
        Self::new(0, len, dim)
    }
}

impl Loading for SumLoading {
    fn dim(&self) -> usize {
        self.dim
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn zx(&self, _pos: usize, x: DVectorView<'_, f64>) -> f64 {
        compensated_sum(x.rows(self.start, self.len).iter())
    }

    fn xpz(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>, d: f64) {
        x.rows_mut(self.start, self.len).add_scalar_mut(d);
    }

    fn zvz(&self, _pos: usize, v: DMatrixView<'_, f64>) -> f64 {
        compensated_sum(v.view((self.start, self.start), (self.len, self.len)).iter())
    }
}

/// Row `pos` of a regressor matrix; zero beyond the sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionLoading {
    x: DMatrix<f64>,
}

impl RegressionLoading {
    pub fn new(x: DMatrix<f64>) -> Self {
        Self { x }
    }

    pub fn regressors(&self) -> &DMatrix<f64> {
        &self.x
    }
}

impl Loading for RegressionLoading {
    fn dim(&self) -> usize {
        self.x.ncols()
    }

    fn is_time_invariant(&self) -> bool {
        false
    }

    fn zx(&self, pos: usize, x: DVectorView<'_, f64>) -> f64 {
        if pos >= self.x.nrows() {
            return 0.0;
        }
        compensated_dot(self.x.row(pos).iter(), x.iter())
    }

    fn xpz(&self, pos: usize, mut x: DVectorViewMut<'_, f64>, d: f64) {
        if pos >= self.x.nrows() {
            return;
        }
        for j in 0..self.x.ncols() {
            x[j] += d * self.x[(pos, j)];
        }
    }
}

/// Sum of loadings defined on consecutive sub-vectors of the state.
#[derive(Debug)]
pub struct CompositeLoading {
    parts: Vec<(usize, Box<dyn Loading>)>,
    dim: usize,
}

impl CompositeLoading {
    /// `parts` pairs a state offset with a loading on the sub-vector starting there.
    pub fn new(parts: Vec<(usize, Box<dyn Loading>)>, dim: usize) -> Result<Self> {
        for (start, l) in &parts {
            if start + l.dim() > dim {
                return Err(SsfError::DimensionMismatch {
                    expected: dim,
                    got: start + l.dim(),
                });
            }
        }
        Ok(Self { parts, dim })
    }
}

impl Loading for CompositeLoading {
    fn dim(&self) -> usize {
        self.dim
    }

    fn is_time_invariant(&self) -> bool {
        self.parts.iter().all(|(_, l)| l.is_time_invariant())
    }

    fn zx(&self, pos: usize, x: DVectorView<'_, f64>) -> f64 {
        let mut acc = NeumaierSum::new();
        for (start, l) in &self.parts {
            acc.push(l.zx(pos, x.rows(*start, l.dim())));
        }
        acc.value()
    }

    fn xpz(&self, pos: usize, mut x: DVectorViewMut<'_, f64>, d: f64) {
        for (start, l) in &self.parts {
            l.xpz(pos, x.rows_mut(*start, l.dim()), d);
        }
    }

    fn zm(&self, pos: usize, m: DMatrixView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        out.fill(0.0);
        let mut tmp = DVector::zeros(m.ncols());
        for (start, l) in &self.parts {
            let k = m.ncols();
            l.zm(pos, m.rows(*start, l.dim()), tmp.rows_mut(0, k));
            out += &tmp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{mview, vmut, vview};
    use approx::assert_abs_diff_eq;

    fn check_against_row(l: &dyn Loading, pos: usize) {
        let n = l.dim();
        let z = l.row(pos);
        let x = DVector::from_fn(n, |i, _| 0.5 + i as f64);
        let m = DMatrix::from_fn(n, n, |i, j| 1.0 / (1.0 + i as f64 + j as f64));

        assert_abs_diff_eq!(l.zx(pos, vview(&x)), z.dot(&x), epsilon = 1e-12);

        let mut y = x.clone();
        l.xpz(pos, vmut(&mut y), 2.0);
        assert_abs_diff_eq!(y, &x + &z * 2.0, epsilon = 1e-12);

        let mut out = DVector::zeros(n);
        l.zm(pos, mview(&m), vmut(&mut out));
        assert_abs_diff_eq!(out, m.tr_mul(&z), epsilon = 1e-12);

        assert_abs_diff_eq!(l.zvz(pos, mview(&m)), z.dot(&(&m * &z)), epsilon = 1e-12);
    }

    #[test]
    fn test_loadings_match_materialized_rows() {
        check_against_row(&DenseLoading::from_slice(&[1.0, -2.0, 0.5]), 0);
        check_against_row(&CoordinateLoading::new(2, 4).unwrap(), 0);
        check_against_row(&SumLoading::new(1, 2, 4).unwrap(), 0);
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        check_against_row(&RegressionLoading::new(x), 1);
    }

    #[test]
    fn test_regression_zero_beyond_sample() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let l = RegressionLoading::new(x);
        let a = DVector::from_vec(vec![1.0, 1.0]);
        assert_abs_diff_eq!(l.zx(1, vview(&a)), 7.0);
        assert_abs_diff_eq!(l.zx(5, vview(&a)), 0.0);
        assert_abs_diff_eq!(l.row(5).norm(), 0.0);
    }

    #[test]
    fn test_composite_sums_parts() {
        let l = CompositeLoading::new(
            vec![
                (0, Box::new(CoordinateLoading::new(0, 2).unwrap()) as Box<dyn Loading>),
                (2, Box::new(SumLoading::first(2, 2).unwrap())),
            ],
            4,
        )
        .unwrap();
        let z = l.row(0);
        assert_eq!(z.as_slice(), &[1.0, 0.0, 1.0, 1.0]);
        check_against_row(&l, 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(CoordinateLoading::new(3, 3).is_err());
        assert!(SumLoading::new(2, 2, 3).is_err());
        let parts: Vec<(usize, Box<dyn Loading>)> =
            vec![(2, Box::new(CoordinateLoading::new(0, 2).unwrap()))];
        assert!(CompositeLoading::new(parts, 3).is_err());
    }
}
