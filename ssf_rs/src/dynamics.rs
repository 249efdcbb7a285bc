//! State dynamics: transition T(t) and innovation factor S(t), V = S·S'.
//!
//! The filter never needs T or V as matrices; it calls the in-place
//! operators below. Structural implementations (AR(1), random walks,
//! identity blocks) override them with O(n) code, while `MatrixDynamics`
//! and `VaryingDynamics` rely on the materializing defaults.

use std::fmt;

use nalgebra::{DMatrix, DMatrixViewMut, DVectorView, DVectorViewMut};

use crate::error::{Result, SsfError};
use crate::linalg::is_psd;

const PSD_TOLERANCE: f64 = 1e-9;

pub trait Dynamics: Send + Sync + fmt::Debug {
    /// State dimension n.
    fn dim(&self) -> usize;

    /// Number of columns r of the innovation factor S.
    fn innovation_dim(&self) -> usize;

    fn is_time_invariant(&self) -> bool;

    fn is_valid(&self) -> bool;

    /// T(pos), n×n.
    fn transition(&self, pos: usize) -> DMatrix<f64>;

    /// S(pos), n×r.
    fn innovation_factor(&self, pos: usize) -> DMatrix<f64>;

    /// V(pos) = S·S'.
    fn innovation_var(&self, pos: usize) -> DMatrix<f64> {
        let s = self.innovation_factor(pos);
        &s * s.transpose()
    }

    /// x <- T·x
    fn tx(&self, pos: usize, mut x: DVectorViewMut<'_, f64>) {
        let y = self.transition(pos) * &x;
        x.copy_from(&y);
    }

    /// x <- T'·x
    fn xt(&self, pos: usize, mut x: DVectorViewMut<'_, f64>) {
        let y = self.transition(pos).tr_mul(&x);
        x.copy_from(&y);
    }

    /// M <- T·M
    fn tm(&self, pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        for j in 0..m.ncols() {
            self.tx(pos, m.column_mut(j));
        }
    }

    /// M <- M·T'
    fn mt(&self, pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        let r = &m * self.transition(pos).transpose();
        m.copy_from(&r);
    }

    /// P <- P + V
    fn add_v(&self, pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        p += self.innovation_var(pos);
    }

    /// out <- out + V·x
    fn add_vx(&self, pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        let v = self.innovation_var(pos);
        out.gemv(1.0, &v, &x, 1.0);
    }
}

fn check_pair(t: &DMatrix<f64>, s: &DMatrix<f64>) -> Result<()> {
    if !t.is_square() {
        return Err(SsfError::InvalidSystem(format!(
            "transition matrix must be square, got {}x{}",
            t.nrows(),
            t.ncols()
        )));
    }
    if s.nrows() != t.nrows() {
        return Err(SsfError::DimensionMismatch {
            expected: t.nrows(),
            got: s.nrows(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Materialized dynamics
// ---------------------------------------------------------------------------

/// Time-invariant T and S given as matrices.
#[derive(Debug, Clone)]
pub struct MatrixDynamics {
    t: DMatrix<f64>,
    s: DMatrix<f64>,
    v: DMatrix<f64>,
}

impl MatrixDynamics {
    pub fn new(t: DMatrix<f64>, s: DMatrix<f64>) -> Result<Self> {
        check_pair(&t, &s)?;
        let v = &s * s.transpose();
        Ok(Self { t, s, v })
    }

    /// Build from T and the innovation covariance V instead of its factor.
    pub fn from_variance(t: DMatrix<f64>, v: DMatrix<f64>) -> Result<Self> {
        let s = crate::linalg::cholesky_psd(&v, PSD_TOLERANCE)
            .map_err(|e| SsfError::InvalidSystem(format!("innovation variance: {}", e)))?;
        Self::new(t, s)
    }
}

impl Dynamics for MatrixDynamics {
    fn dim(&self) -> usize {
        self.t.nrows()
    }

    fn innovation_dim(&self) -> usize {
        self.s.ncols()
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.t.iter().all(|x| x.is_finite())
            && self.s.iter().all(|x| x.is_finite())
            && check_pair(&self.t, &self.s).is_ok()
    }

    fn transition(&self, _pos: usize) -> DMatrix<f64> {
        self.t.clone()
    }

    fn innovation_factor(&self, _pos: usize) -> DMatrix<f64> {
        self.s.clone()
    }

    fn innovation_var(&self, _pos: usize) -> DMatrix<f64> {
        self.v.clone()
    }

    fn tx(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        let y = &self.t * &x;
        x.copy_from(&y);
    }

    fn xt(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        let y = self.t.tr_mul(&x);
        x.copy_from(&y);
    }

    fn mt(&self, _pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        let r = &m * self.t.transpose();
        m.copy_from(&r);
    }

    fn add_v(&self, _pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        p += &self.v;
    }

    fn add_vx(&self, _pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        out.gemv(1.0, &self.v, &x, 1.0);
    }
}

/// Per-period T(t) and S(t); the last entry is reused beyond the end.
#[derive(Debug, Clone)]
pub struct VaryingDynamics {
    t: Vec<DMatrix<f64>>,
    s: Vec<DMatrix<f64>>,
}

impl VaryingDynamics {
    pub fn new(t: Vec<DMatrix<f64>>, s: Vec<DMatrix<f64>>) -> Result<Self> {
        if t.is_empty() || t.len() != s.len() {
            return Err(SsfError::DimensionMismatch {
                expected: t.len(),
                got: s.len(),
            });
        }
        let n = t[0].nrows();
        for (ti, si) in t.iter().zip(s.iter()) {
            check_pair(ti, si)?;
            if ti.nrows() != n {
                return Err(SsfError::DimensionMismatch {
                    expected: n,
                    got: ti.nrows(),
                });
            }
        }
        Ok(Self { t, s })
    }

    fn index(&self, pos: usize) -> usize {
        pos.min(self.t.len() - 1)
    }
}

impl Dynamics for VaryingDynamics {
    fn dim(&self) -> usize {
        self.t[0].nrows()
    }

    fn innovation_dim(&self) -> usize {
        self.s[0].ncols()
    }

    fn is_time_invariant(&self) -> bool {
        self.t.len() == 1
    }

    fn is_valid(&self) -> bool {
        let n = self.dim();
        let r = self.innovation_dim();
        self.t.iter().zip(self.s.iter()).all(|(t, s)| {
            t.shape() == (n, n)
                && s.shape() == (n, r)
                && t.iter().all(|x| x.is_finite())
                && s.iter().all(|x| x.is_finite())
        })
    }

    fn transition(&self, pos: usize) -> DMatrix<f64> {
        self.t[self.index(pos)].clone()
    }

    fn innovation_factor(&self, pos: usize) -> DMatrix<f64> {
        self.s[self.index(pos)].clone()
    }
}

// ---------------------------------------------------------------------------
// Structural dynamics
// ---------------------------------------------------------------------------

/// x_{t+1} = rho·x_t + e, e ~ N(0, var)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ar1Dynamics {
    pub rho: f64,
    pub var: f64,
}

impl Ar1Dynamics {
    pub fn new(rho: f64, var: f64) -> Self {
        Self { rho, var }
    }
}

impl Dynamics for Ar1Dynamics {
    fn dim(&self) -> usize {
        1
    }

    fn innovation_dim(&self) -> usize {
        1
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.rho.is_finite() && self.var.is_finite() && self.var >= 0.0
    }

    fn transition(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.rho)
    }

    fn innovation_factor(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.var.max(0.0).sqrt())
    }

    fn innovation_var(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.var)
    }

    fn tx(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        x[0] *= self.rho;
    }

    fn xt(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        x[0] *= self.rho;
    }

    fn tm(&self, _pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        m *= self.rho;
    }

    fn mt(&self, _pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        m *= self.rho;
    }

    fn add_v(&self, _pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        p[(0, 0)] += self.var;
    }

    fn add_vx(&self, _pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        out[0] += self.var * x[0];
    }
}

/// x_{t+1} = x_t + e, e ~ N(0, var)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWalkDynamics {
    pub var: f64,
}

impl RandomWalkDynamics {
    pub fn new(var: f64) -> Self {
        Self { var }
    }
}

impl Dynamics for RandomWalkDynamics {
    fn dim(&self) -> usize {
        1
    }

    fn innovation_dim(&self) -> usize {
        1
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.var.is_finite() && self.var >= 0.0
    }

    fn transition(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, 1.0)
    }

    fn innovation_factor(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.var.max(0.0).sqrt())
    }

    fn tx(&self, _pos: usize, _x: DVectorViewMut<'_, f64>) {}

    fn xt(&self, _pos: usize, _x: DVectorViewMut<'_, f64>) {}

    fn tm(&self, _pos: usize, _m: DMatrixViewMut<'_, f64>) {}

    fn mt(&self, _pos: usize, _m: DMatrixViewMut<'_, f64>) {}

    fn add_v(&self, _pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        p[(0, 0)] += self.var;
    }

    fn add_vx(&self, _pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        out[0] += self.var * x[0];
    }
}

/// Integrated random walk in its continuous-time (cubic spline) form:
///
///   T = [[1, 1], [0, 1]],  V = var·[[1/3, 1/2], [1/2, 1]]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegratedRandomWalkDynamics {
    pub var: f64,
}

impl IntegratedRandomWalkDynamics {
    pub fn new(var: f64) -> Self {
        Self { var }
    }
}

impl Dynamics for IntegratedRandomWalkDynamics {
    fn dim(&self) -> usize {
        2
    }

    fn innovation_dim(&self) -> usize {
        2
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.var.is_finite() && self.var >= 0.0
    }

    fn transition(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0])
    }

    fn innovation_factor(&self, _pos: usize) -> DMatrix<f64> {
        // Cholesky factor of [[1/3, 1/2], [1/2, 1]]
        let s = self.var.max(0.0).sqrt();
        let l11 = (1.0_f64 / 3.0).sqrt();
        DMatrix::from_row_slice(2, 2, &[s * l11, 0.0, s * 0.5 / l11, s * 0.5])
    }

    fn innovation_var(&self, _pos: usize) -> DMatrix<f64> {
        let v = self.var;
        DMatrix::from_row_slice(2, 2, &[v / 3.0, v / 2.0, v / 2.0, v])
    }

    fn tx(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        x[0] += x[1];
    }

    fn xt(&self, _pos: usize, mut x: DVectorViewMut<'_, f64>) {
        x[1] += x[0];
    }

    fn tm(&self, _pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        for j in 0..m.ncols() {
            m[(0, j)] += m[(1, j)];
        }
    }

    fn mt(&self, _pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        for i in 0..m.nrows() {
            m[(i, 0)] += m[(i, 1)];
        }
    }

    fn add_v(&self, _pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        let v = self.var;
        p[(0, 0)] += v / 3.0;
        p[(0, 1)] += v / 2.0;
        p[(1, 0)] += v / 2.0;
        p[(1, 1)] += v;
    }

    fn add_vx(&self, _pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        let v = self.var;
        out[0] += v * (x[0] / 3.0 + x[1] / 2.0);
        out[1] += v * (x[0] / 2.0 + x[1]);
    }
}

/// Identity transition without innovation (regression coefficients, fixed levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantDynamics {
    dim: usize,
}

impl ConstantDynamics {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Dynamics for ConstantDynamics {
    fn dim(&self) -> usize {
        self.dim
    }

    fn innovation_dim(&self) -> usize {
        0
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn transition(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::identity(self.dim, self.dim)
    }

    fn innovation_factor(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::zeros(self.dim, 0)
    }

    fn innovation_var(&self, _pos: usize) -> DMatrix<f64> {
        DMatrix::zeros(self.dim, self.dim)
    }

    fn tx(&self, _pos: usize, _x: DVectorViewMut<'_, f64>) {}

    fn xt(&self, _pos: usize, _x: DVectorViewMut<'_, f64>) {}

    fn tm(&self, _pos: usize, _m: DMatrixViewMut<'_, f64>) {}

    fn mt(&self, _pos: usize, _m: DMatrixViewMut<'_, f64>) {}

    fn add_v(&self, _pos: usize, _p: DMatrixViewMut<'_, f64>) {}

    fn add_vx(&self, _pos: usize, _x: DVectorView<'_, f64>, _out: DVectorViewMut<'_, f64>) {}
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Block-diagonal direct sum of independent dynamics.
#[derive(Debug)]
pub struct CompositeDynamics {
    blocks: Vec<Box<dyn Dynamics>>,
    offsets: Vec<usize>,
    dim: usize,
}

impl CompositeDynamics {
    pub fn new(blocks: Vec<Box<dyn Dynamics>>) -> Self {
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut dim = 0;
        for b in &blocks {
            offsets.push(dim);
            dim += b.dim();
        }
        Self {
            blocks,
            offsets,
            dim,
        }
    }

    pub fn blocks(&self) -> &[Box<dyn Dynamics>] {
        &self.blocks
    }

    fn parts(&self) -> impl Iterator<Item = (usize, &dyn Dynamics)> + '_ {
        self.offsets
            .iter()
            .copied()
            .zip(self.blocks.iter().map(|b| b.as_ref()))
    }
}

impl Dynamics for CompositeDynamics {
    fn dim(&self) -> usize {
        self.dim
    }

    fn innovation_dim(&self) -> usize {
        self.blocks.iter().map(|b| b.innovation_dim()).sum()
    }

    fn is_time_invariant(&self) -> bool {
        self.blocks.iter().all(|b| b.is_time_invariant())
    }

    fn is_valid(&self) -> bool {
        self.blocks.iter().all(|b| b.is_valid())
    }

    fn transition(&self, pos: usize) -> DMatrix<f64> {
        let mut t = DMatrix::zeros(self.dim, self.dim);
        for (start, b) in self.parts() {
            let n = b.dim();
            t.view_mut((start, start), (n, n))
                .copy_from(&b.transition(pos));
        }
        t
    }

    fn innovation_factor(&self, pos: usize) -> DMatrix<f64> {
        let mut s = DMatrix::zeros(self.dim, self.innovation_dim());
        let mut col = 0;
        for (start, b) in self.parts() {
            let (n, r) = (b.dim(), b.innovation_dim());
            if r > 0 {
                s.view_mut((start, col), (n, r))
                    .copy_from(&b.innovation_factor(pos));
            }
            col += r;
        }
        s
    }

    fn innovation_var(&self, pos: usize) -> DMatrix<f64> {
        let mut v = DMatrix::zeros(self.dim, self.dim);
        for (start, b) in self.parts() {
            let n = b.dim();
            b.add_v(pos, v.view_mut((start, start), (n, n)));
        }
        v
    }

    fn tx(&self, pos: usize, mut x: DVectorViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            b.tx(pos, x.rows_mut(start, b.dim()));
        }
    }

    fn xt(&self, pos: usize, mut x: DVectorViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            b.xt(pos, x.rows_mut(start, b.dim()));
        }
    }

    fn tm(&self, pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            b.tm(pos, m.rows_mut(start, b.dim()));
        }
    }

    fn mt(&self, pos: usize, mut m: DMatrixViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            b.mt(pos, m.columns_mut(start, b.dim()));
        }
    }

    fn add_v(&self, pos: usize, mut p: DMatrixViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            let n = b.dim();
            b.add_v(pos, p.view_mut((start, start), (n, n)));
        }
    }

    fn add_vx(&self, pos: usize, x: DVectorView<'_, f64>, mut out: DVectorViewMut<'_, f64>) {
        for (start, b) in self.parts() {
            let n = b.dim();
            b.add_vx(pos, x.rows(start, n), out.rows_mut(start, n));
        }
    }
}

/// Full validity check on materialized matrices, used by `StateSpaceSystem::validate`.
pub fn check_dynamics(dynamics: &dyn Dynamics, pos: usize) -> Result<()> {
    if !dynamics.is_valid() {
        return Err(SsfError::InvalidSystem("invalid dynamics".to_string()));
    }
    let n = dynamics.dim();
    let t = dynamics.transition(pos);
    if t.shape() != (n, n) {
        return Err(SsfError::DimensionMismatch {
            expected: n,
            got: t.nrows(),
        });
    }
    let v = dynamics.innovation_var(pos);
    if !is_psd(&v, PSD_TOLERANCE) {
        return Err(SsfError::InvalidSystem(
            "innovation variance is not positive semi-definite".to_string(),
        ));
    }
    Ok(())
}
