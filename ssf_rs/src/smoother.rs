//! Backward smoothing over the output of the diffuse Kalman filter.
//!
//! Notation: r_t is the weighted sum of future innovations before step t is
//! processed, r_{t-1} after. Ordinary steps, with K = T·M/F and L = T - K·Z:
//!
//!   r_{t-1} = Z'·e/F + L'·r_t
//!   N_{t-1} = Z'·Z/F + L'·N_t·L
//!   â_t     = a_t + P_t·r_{t-1}
//!   V_t     = P_t - P_t·N_{t-1}·P_t
//!
//! Informative diffuse steps carry (r0, r1) and (N0, N1, N2) with
//! K0 = T·Mi/F∞, K1 = T·(Mf/F∞ - Mi·F/F∞²), L0 = T - K0·Z, L1 = -K1·Z.
//!
//! The fast smoother only runs the r recursion and rebuilds the means
//! forward from â_0 = a0 + Pf0·r0 + Pi0·r1 with â_{t+1} = T·â_t + V·r_t.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::dynamics::Dynamics;
use crate::error::{Result, SsfError};
use crate::linalg::{clean_diagonal, symmetrize, triangularize, vmut, vview};
use crate::loading::Loading;
use crate::results::{FilteringResults, StepKind};
use crate::storage::{MatrixStore, ScalarStore, VectorStore};
use crate::system::StateSpaceSystem;
use crate::types::{SmoothingMode, SsfConfig};

/// Smoothed states, optional covariances and smoothed disturbances.
#[derive(Debug, Clone)]
pub struct SmoothingResults {
    pub(crate) states: VectorStore,
    pub(crate) variances: Option<MatrixStore>,
    pub(crate) state_disturbances: VectorStore,
    pub(crate) measurement_disturbances: ScalarStore,
    pub(crate) len: usize,
}

impl SmoothingResults {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.states.dim()
    }

    /// E[a_t | y_0..y_{N-1}]
    pub fn state(&self, t: usize) -> Option<DVector<f64>> {
        self.states.get(t)
    }

    /// Var[a_t | y_0..y_{N-1}] (full smoothing only).
    pub fn variance(&self, t: usize) -> Option<DMatrix<f64>> {
        self.variances.as_ref().and_then(|v| v.get(t))
    }

    pub fn has_variances(&self) -> bool {
        self.variances.is_some()
    }

    /// Smoothed path of coordinate `i`; NaN where not stored.
    pub fn component(&self, i: usize) -> Vec<f64> {
        let mut path = self.states.component(i);
        path.resize(self.len, f64::NAN);
        path
    }

    /// Smoothed variance of coordinate `i` over time.
    pub fn component_variance(&self, i: usize) -> Option<Vec<f64>> {
        self.variances.as_ref().map(|v| {
            let mut path = v.component(i);
            path.resize(self.len, f64::NAN);
            path
        })
    }

    /// V_t·r_t, the smoothed state disturbance entering a_{t+1}.
    pub fn state_disturbance(&self, t: usize) -> Option<DVector<f64>> {
        self.state_disturbances.get(t)
    }

    /// H_t·u_t, the smoothed measurement error.
    pub fn measurement_disturbance(&self, t: usize) -> Option<f64> {
        self.measurement_disturbances.get(t)
    }

    pub fn measurement_disturbances(&self) -> Vec<f64> {
        let mut v = self.measurement_disturbances.values();
        v.resize(self.len, f64::NAN);
        v
    }

    /// Correct for observations that were divided by `factor` before filtering.
    pub fn rescale(&mut self, factor: f64) {
        self.states.rescale(factor);
        if let Some(v) = &mut self.variances {
            v.rescale(factor * factor);
        }
        self.state_disturbances.rescale(factor);
        self.measurement_disturbances.rescale(factor);
    }
}

/// Smooth the output of `filter`.
///
/// `config.smoothing` selects the fast (means only) or the full smoother; the
/// full smoother runs in square-root form when the filter did.
pub fn smooth(
    system: &StateSpaceSystem,
    filtering: &FilteringResults,
    config: &SsfConfig,
) -> Result<SmoothingResults> {
    let n = system.state_dim();
    if filtering.initialization().dim() != n {
        return Err(SsfError::DimensionMismatch {
            expected: n,
            got: filtering.initialization().dim(),
        });
    }
    debug!(
        len = filtering.len(),
        mode = ?config.smoothing,
        square_root = filtering.is_square_root(),
        "smoothing"
    );
    match config.smoothing {
        SmoothingMode::Fast => Ok(fast_smooth(system, filtering, config)),
        SmoothingMode::Full => {
            if !filtering.has_covariances() {
                return Err(SsfError::DataError(
                    "full smoothing requires stored covariances".to_string(),
                ));
            }
            if filtering.states.is_none() {
                return Err(SsfError::DataError(
                    "full smoothing requires stored states".to_string(),
                ));
            }
            full_smooth(system, filtering, config)
        }
    }
}

fn gain(filtering: &FilteringResults, t: usize, n: usize) -> DVector<f64> {
    filtering.m.get(t).unwrap_or_else(|| DVector::zeros(n))
}

fn diffuse_gain(filtering: &FilteringResults, t: usize, n: usize) -> DVector<f64> {
    filtering.mi.get(t).unwrap_or_else(|| DVector::zeros(n))
}

/// One backward step on (r0, r1). Returns u_t, with the smoothed measurement
/// error H_t·u_t.
fn backward_r(
    dynamics: &dyn Dynamics,
    loading: &dyn Loading,
    filtering: &FilteringResults,
    t: usize,
    r0: &mut DVector<f64>,
    r1: &mut DVector<f64>,
    diffuse: bool,
) -> f64 {
    let n = r0.nrows();
    match filtering.kinds[t] {
        StepKind::Missing | StepKind::Degenerate => {
            dynamics.xt(t, vmut(r0));
            if diffuse {
                dynamics.xt(t, vmut(r1));
            }
            0.0
        }
        StepKind::Ordinary => {
            let m = gain(filtering, t, n);
            let (e, f) = (filtering.e[t], filtering.f[t]);
            dynamics.xt(t, vmut(r0));
            // u = e/F - K'·r_t
            let u = (e - m.dot(&*r0)) / f;
            loading.xpz(t, vmut(r0), u);
            if diffuse {
                dynamics.xt(t, vmut(r1));
            }
            u
        }
        StepKind::Diffuse => {
            let mi = diffuse_gain(filtering, t, n);
            let mf = gain(filtering, t, n);
            let (e, f, fi) = (filtering.e[t], filtering.f[t], filtering.fi[t]);
            dynamics.xt(t, vmut(r0));
            dynamics.xt(t, vmut(r1));
            let mi_r0 = mi.dot(&*r0);
            let mf_r0 = mf.dot(&*r0);
            let mi_r1 = mi.dot(&*r1);
            let c1 = (e - mi_r1 - mf_r0) / fi + mi_r0 * f / (fi * fi);
            loading.xpz(t, vmut(r1), c1);
            loading.xpz(t, vmut(r0), -mi_r0 / fi);
            -mi_r0 / fi
        }
    }
}

// ---------------------------------------------------------------------------
// Fast smoother
// ---------------------------------------------------------------------------

fn fast_smooth(
    system: &StateSpaceSystem,
    filtering: &FilteringResults,
    config: &SsfConfig,
) -> SmoothingResults {
    let dynamics = system.dynamics();
    let loading = system.loading();
    let n = system.state_dim();
    let len = filtering.len();
    let start = config.storage_start;
    let diffuse_end = filtering.diffuse_end();

    let mut r0 = DVector::zeros(n);
    let mut r1 = DVector::zeros(n);
    let mut rs = vec![DVector::zeros(0); len];
    let mut measurement_disturbances = ScalarStore::new(start, len);
    for t in (0..len).rev() {
        rs[t] = r0.clone();
        let u = backward_r(dynamics, loading, filtering, t, &mut r0, &mut r1, t < diffuse_end);
        measurement_disturbances.save(t, system.measurement_variance(t) * u);
    }

    let init = filtering.initialization();
    let mut alpha = init.a0.clone();
    alpha.gemv(1.0, &init.pf0, &r0, 1.0);
    if init.is_diffuse() {
        alpha.gemv(1.0, &init.pi0(), &r1, 1.0);
    }

    let mut states = VectorStore::new(n, start, len);
    let mut state_disturbances = VectorStore::new(n, start, len);
    let mut vr = DVector::zeros(n);
    for (t, r) in rs.iter().enumerate() {
        states.save(t, &alpha);
        vr.fill(0.0);
        dynamics.add_vx(t, vview(r), vmut(&mut vr));
        state_disturbances.save(t, &vr);
        dynamics.tx(t, vmut(&mut alpha));
        alpha += &vr;
    }

    SmoothingResults {
        states,
        variances: None,
        state_disturbances,
        measurement_disturbances,
        len,
    }
}

// ---------------------------------------------------------------------------
// Full smoother
// ---------------------------------------------------------------------------

/// N_t in covariance form, with the diffuse companions N1 and N2.
struct Information {
    n0: DMatrix<f64>,
    n1: DMatrix<f64>,
    n2: DMatrix<f64>,
}

impl Information {
    fn new(n: usize) -> Self {
        Self {
            n0: DMatrix::zeros(n, n),
            n1: DMatrix::zeros(n, n),
            n2: DMatrix::zeros(n, n),
        }
    }

    fn step(
        &mut self,
        dynamics: &dyn Dynamics,
        loading: &dyn Loading,
        filtering: &FilteringResults,
        t: usize,
        diffuse: bool,
    ) {
        let n = self.n0.nrows();
        let tm = dynamics.transition(t);
        match filtering.kinds[t] {
            StepKind::Missing | StepKind::Degenerate => {
                self.n0 = tm.tr_mul(&self.n0) * &tm;
                if diffuse {
                    self.n1 = tm.tr_mul(&self.n1) * &tm;
                    self.n2 = tm.tr_mul(&self.n2) * &tm;
                }
            }
            StepKind::Ordinary => {
                let z = loading.row(t);
                let f = filtering.f[t];
                let k = &tm * gain(filtering, t, n) / f;
                let l = &tm - &k * z.transpose();
                self.n0 = l.tr_mul(&self.n0) * &l + &z * z.transpose() / f;
                if diffuse {
                    self.n1 = l.tr_mul(&self.n1) * &l;
                    self.n2 = l.tr_mul(&self.n2) * &l;
                }
            }
            StepKind::Diffuse => {
                let z = loading.row(t);
                let (f, fi) = (filtering.f[t], filtering.fi[t]);
                let f1 = 1.0 / fi;
                let f2 = -f / (fi * fi);
                let k0 = &tm * diffuse_gain(filtering, t, n) * f1;
                let k1 = &tm * gain(filtering, t, n) * f1 + &k0 * (f2 / f1);
                let l0 = &tm - &k0 * z.transpose();
                let l1 = -(&k1 * z.transpose());
                let zz = &z * z.transpose();

                let n0 = l0.tr_mul(&self.n0) * &l0;
                let n1 = l0.tr_mul(&self.n1) * &l0
                    + l1.tr_mul(&self.n0) * &l0
                    + l0.tr_mul(&self.n0) * &l1
                    + &zz * f1;
                let n2 = l0.tr_mul(&self.n2) * &l0
                    + l0.tr_mul(&self.n1) * &l1
                    + l1.tr_mul(&self.n1) * &l0
                    + l1.tr_mul(&self.n0) * &l1
                    + &zz * f2;
                self.n0 = n0;
                self.n1 = n1;
                self.n2 = n2;
            }
        }
    }
}

/// G_t with N_t = G_t·G_t', used in the ordinary phase of square-root runs:
/// G_{t-1} = tri([Z'/sqrt(F), L'·G_t]).
fn factor_step(
    dynamics: &dyn Dynamics,
    loading: &dyn Loading,
    filtering: &FilteringResults,
    t: usize,
    g: &mut DMatrix<f64>,
) {
    let (n, k) = g.shape();
    for j in 0..k {
        dynamics.xt(t, g.column_mut(j));
    }
    match filtering.kinds[t] {
        StepKind::Missing | StepKind::Degenerate => {}
        StepKind::Ordinary | StepKind::Diffuse => {
            let m = gain(filtering, t, n);
            let f = filtering.f[t];
            // L'·x = T'·x - Z'·(M·T'·x)/F
            for j in 0..k {
                let c = m.dot(&g.column(j)) / f;
                loading.xpz(t, g.column_mut(j), -c);
            }
            let mut w = DMatrix::zeros(n, k + 1);
            w.column_mut(0).copy_from(&(loading.row(t) / f.sqrt()));
            w.columns_mut(1, k).copy_from(&*g);
            *g = triangularize(&w);
        }
    }
}

fn full_smooth(
    system: &StateSpaceSystem,
    filtering: &FilteringResults,
    config: &SsfConfig,
) -> Result<SmoothingResults> {
    let dynamics = system.dynamics();
    let loading = system.loading();
    let n = system.state_dim();
    let len = filtering.len();
    let start = config.storage_start;
    let diffuse_end = filtering.diffuse_end();
    let tol = config.zero_tolerance;

    let mut r0 = DVector::zeros(n);
    let mut r1 = DVector::zeros(n);
    let mut info = Information::new(n);
    let mut factor = filtering
        .is_square_root()
        .then(|| DMatrix::zeros(n, n));

    let mut states = VectorStore::new(n, start, len);
    let mut variances = MatrixStore::new(n, start, len);
    let mut state_disturbances = VectorStore::new(n, start, len);
    let mut measurement_disturbances = ScalarStore::new(start, len);
    let mut vr = DVector::zeros(n);

    for t in (0..len).rev() {
        let diffuse = t < diffuse_end;
        if diffuse {
            if let Some(g) = factor.take() {
                info.n0 = &g * g.transpose();
            }
        }

        if t >= start {
            vr.fill(0.0);
            dynamics.add_vx(t, vview(&r0), vmut(&mut vr));
            state_disturbances.save(t, &vr);
        }

        match &mut factor {
            Some(g) => factor_step(dynamics, loading, filtering, t, g),
            None => info.step(dynamics, loading, filtering, t, diffuse),
        }
        let u = backward_r(dynamics, loading, filtering, t, &mut r0, &mut r1, diffuse);
        measurement_disturbances.save(t, system.measurement_variance(t) * u);

        if t < start {
            continue;
        }
        let (mut alpha, p) = match (filtering.predicted_state(t), filtering.predicted_covariance(t)) {
            (Some(a), Some(p)) => (a, p),
            _ => {
                return Err(SsfError::DataError(format!(
                    "filter output missing at t={}",
                    t
                )))
            }
        };
        alpha.gemv(1.0, &p, &r0, 1.0);
        let mut v = match &factor {
            Some(g) => {
                let pg = &p * g;
                &p - &pg * pg.transpose()
            }
            None => &p - &p * &info.n0 * &p,
        };
        if diffuse {
            if let Some(pi) = filtering.diffuse_covariance(t) {
                alpha.gemv(1.0, &pi, &r1, 1.0);
                let pn1p = &pi * &info.n1 * &p;
                v -= &pn1p;
                v -= pn1p.transpose();
                v -= &pi * &info.n2 * &pi;
            }
        }
        symmetrize(&mut v);
        let scale = tol * v.amax().max(1.0);
        clean_diagonal(&mut v, scale);
        states.save(t, &alpha);
        variances.save(t, &v);
    }

    Ok(SmoothingResults {
        states,
        variances: Some(variances),
        state_disturbances,
        measurement_disturbances,
        len,
    })
}
