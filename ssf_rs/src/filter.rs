//! Exact diffuse Kalman filter (univariate observations).
//!
//! Diffuse phase, while rank(Pi) > 0:
//!   Mf = Pf·Z',  F  = Z·Pf·Z' + H
//!   Mi = Pi·Z',  F∞ = Z·Pi·Z'
//!   F∞ > 0:  a  += Mi·e/F∞
//!            Pf += Mi·Mi'·F/F∞² - (Mi·Mf' + Mf·Mi')/F∞
//!            Pi -= Mi·Mi'/F∞                    (rank drops by one)
//!   F∞ = 0:  ordinary update of (a, Pf)
//!
//! Ordinary phase:
//!   e = y - Z·a,  F = Z·P·Z' + H,  a += P·Z'·e/F,  P -= P·Z'·Z·P/F
//!
//! Prediction:
//!   a <- T·a,  P <- T·P·T' + V,  Pi <- T·Pi·T'

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace, warn};

use crate::dynamics::Dynamics;
use crate::error::{Result, SsfError};
use crate::initialization::Initialization;
use crate::likelihood::DiffuseLikelihood;
use crate::linalg::{
    cholesky_psd, compensated_dot, mmut, mview, reduce_factor, symmetrize, triangularize, vmut,
    vview,
};
use crate::loading::Loading;
use crate::results::{contribution, FilteringResults, StepKind};
use crate::storage::{MatrixStore, VectorStore};
use crate::system::StateSpaceSystem;
use crate::types::{DiffuseCollapse, DiffuseHandling, SsfConfig};

/// Run the filter over `y` (NaN = missing).
pub fn filter(system: &StateSpaceSystem, y: &[f64], config: &SsfConfig) -> Result<FilteringResults> {
    DiffuseKalmanFilter::new(system, config)?.run(y)
}

pub struct DiffuseKalmanFilter<'a> {
    system: &'a StateSpaceSystem,
    config: SsfConfig,
    initialization: Initialization,
    square_root: bool,
}

impl<'a> DiffuseKalmanFilter<'a> {
    /// Validate the system and resolve the configuration against it.
    pub fn new(system: &'a StateSpaceSystem, config: &SsfConfig) -> Result<Self> {
        system.validate()?;
        if !(config.zero_tolerance.is_finite() && config.zero_tolerance >= 0.0) {
            return Err(SsfError::InvalidSystem(format!(
                "zero tolerance must be finite and non-negative, got {}",
                config.zero_tolerance
            )));
        }
        let initialization = match config.diffuse {
            DiffuseHandling::Exact => system.initialization().clone(),
            DiffuseHandling::Approximate { kappa } => {
                if !(kappa.is_finite() && kappa > 0.0) {
                    return Err(SsfError::InvalidSystem(format!(
                        "kappa must be finite and positive, got {}",
                        kappa
                    )));
                }
                system.initialization().approximate_diffuse(kappa)
            }
        };
        Ok(Self {
            system,
            config: config.clone(),
            initialization,
            square_root: config.square_root(system.is_delicate()),
        })
    }

    pub fn is_square_root(&self) -> bool {
        self.square_root
    }

    pub fn run(&self, y: &[f64]) -> Result<FilteringResults> {
        if let Some(t) = y.iter().position(|v| v.is_infinite()) {
            return Err(SsfError::DataError(format!(
                "observation at t={} is infinite",
                t
            )));
        }

        let dynamics = self.system.dynamics();
        let loading = self.system.loading();
        let n = self.system.state_dim();
        let nobs = y.len();
        let tol = self.config.zero_tolerance;
        let start = self.config.storage_start;

        let mut ws = Workspace::new(
            &self.initialization,
            self.square_root,
            self.config.collapse,
            tol,
        )?;

        debug!(
            nobs,
            dim = n,
            diffuse = ws.rank(),
            square_root = self.square_root,
            collapse = ?self.config.collapse,
            "running diffuse Kalman filter"
        );

        let mut kinds = Vec::with_capacity(nobs);
        let mut es = Vec::with_capacity(nobs);
        let mut fs = Vec::with_capacity(nobs);
        let mut fis = Vec::with_capacity(nobs);
        let mut ranks = Vec::with_capacity(nobs);
        let mut contributions = Vec::with_capacity(nobs);
        let mut m_store = VectorStore::new(n, 0, nobs);
        let mut mi_store = VectorStore::new(n, 0, ws.rank());
        let mut states = self
            .config
            .store_states
            .then(|| VectorStore::new(n, start, nobs));
        let keep_cov = self.config.needs_covariances();
        let mut covariances = (keep_cov && !self.square_root).then(|| MatrixStore::new(n, start, nobs));
        let mut factors = (keep_cov && self.square_root).then(|| MatrixStore::new(n, start, nobs));
        let mut diffuse_covariances = MatrixStore::new(n, start, ws.rank());
        let mut likelihood = DiffuseLikelihood::new();
        let mut diffuse_end = 0;

        for (t, &yt) in y.iter().enumerate() {
            let rank = ws.rank();
            ranks.push(rank);
            if let Some(s) = &mut states {
                s.save(t, &ws.a);
            }
            if let Some(s) = &mut covariances {
                s.save(t, &ws.p);
            }
            if let Some(s) = &mut factors {
                s.save(t, &ws.p);
            }
            if rank > 0 {
                diffuse_end = t + 1;
                if t >= start {
                    diffuse_covariances.save(t, &ws.pi());
                }
            }

            let h = self.system.measurement_variance(t);
            let f = ws.proper_gain(loading, t, h);
            m_store.save(t, &ws.mf);
            let fi = if rank > 0 {
                let fi = ws.diffuse_gain(loading, t);
                mi_store.save(t, &ws.mi);
                fi
            } else {
                f64::NAN
            };

            let kind = if yt.is_nan() {
                StepKind::Missing
            } else {
                if f < -tol {
                    return Err(SsfError::NegativeVariance { t, value: f });
                }
                if rank > 0 && fi < -tol {
                    return Err(SsfError::NegativeVariance { t, value: fi });
                }
                if rank > 0 && fi > tol {
                    StepKind::Diffuse
                } else if f > tol {
                    StepKind::Ordinary
                } else {
                    trace!(t, f, "degenerate observation treated as missing");
                    StepKind::Degenerate
                }
            };

            let e = if kind == StepKind::Missing {
                f64::NAN
            } else {
                yt - loading.zx(t, vview(&ws.a))
            };

            match kind {
                StepKind::Diffuse => {
                    ws.update_diffuse(e, f, fi, h);
                    likelihood.add_diffuse(fi);
                }
                StepKind::Ordinary => {
                    ws.update_ordinary(e, f, h);
                    likelihood.add_ordinary(e, f);
                }
                StepKind::Missing | StepKind::Degenerate => {}
            }

            kinds.push(kind);
            contributions.push(contribution(kind, e, f, fi));
            if kind == StepKind::Missing {
                es.push(f64::NAN);
                fs.push(f64::NAN);
                fis.push(f64::NAN);
            } else {
                es.push(e);
                fs.push(f);
                fis.push(fi);
            }

            ws.predict(dynamics, t)?;
            if rank > 0 && ws.rank() == 0 {
                debug!(t, "diffuse part collapsed");
            }
        }

        let final_rank = ws.rank();
        if final_rank > 0 && nobs > 0 {
            warn!(
                rank = final_rank,
                nobs, "series ended before the diffuse part was identified"
            );
        }

        debug!(
            loglikelihood = likelihood.loglikelihood(),
            n_obs = likelihood.n_obs(),
            diffuse_end,
            "diffuse Kalman filter finished"
        );

        Ok(FilteringResults {
            kinds,
            e: es,
            f: fs,
            fi: fis,
            ranks,
            contributions,
            m: m_store,
            mi: mi_store,
            states,
            covariances,
            factors,
            diffuse_covariances,
            initialization: self.initialization.clone(),
            final_covariance: ws.covariance(),
            final_diffuse: ws.pi(),
            final_state: ws.a,
            final_rank,
            diffuse_end,
            likelihood,
            square_root: self.square_root,
            zero_tolerance: tol,
        })
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Mutable state of one pass.
///
/// `p` holds Pf in standard numerics and its lower factor C (Pf = C·C') in
/// square-root numerics. The diffuse part is either the factor B of
/// Pi = B·B' (one column per unidentified direction) or Pi itself.
struct Workspace {
    a: DVector<f64>,
    p: DMatrix<f64>,
    b: DMatrix<f64>,
    pi: DMatrix<f64>,
    pi_rank: usize,
    mf: DVector<f64>,
    mi: DVector<f64>,
    zc: DVector<f64>,
    zb: DVector<f64>,
    square_root: bool,
    collapse: DiffuseCollapse,
    tol: f64,
}

impl Workspace {
    fn new(
        init: &Initialization,
        square_root: bool,
        collapse: DiffuseCollapse,
        tol: f64,
    ) -> Result<Self> {
        let n = init.dim();
        let p = if square_root {
            cholesky_psd(&init.pf0, tol)?
        } else {
            init.pf0.clone()
        };
        let (b, pi, pi_rank) = match collapse {
            DiffuseCollapse::Factor => (init.b.clone(), DMatrix::zeros(0, 0), 0),
            DiffuseCollapse::Covariance => {
                (DMatrix::zeros(n, 0), init.pi0(), init.diffuse_dim())
            }
        };
        Ok(Self {
            a: init.a0.clone(),
            p,
            b,
            pi,
            pi_rank,
            mf: DVector::zeros(n),
            mi: DVector::zeros(n),
            zc: DVector::zeros(n),
            zb: DVector::zeros(0),
            square_root,
            collapse,
            tol,
        })
    }

    fn rank(&self) -> usize {
        match self.collapse {
            DiffuseCollapse::Factor => self.b.ncols(),
            DiffuseCollapse::Covariance => self.pi_rank,
        }
    }

    fn pi(&self) -> DMatrix<f64> {
        match self.collapse {
            DiffuseCollapse::Factor => &self.b * self.b.transpose(),
            DiffuseCollapse::Covariance => self.pi.clone(),
        }
    }

    fn covariance(&self) -> DMatrix<f64> {
        if self.square_root {
            &self.p * self.p.transpose()
        } else {
            self.p.clone()
        }
    }

    /// Mf = Pf·Z', returns F = Z·Pf·Z' + H.
    fn proper_gain(&mut self, loading: &dyn Loading, t: usize, h: f64) -> f64 {
        if self.square_root {
            loading.zm(t, mview(&self.p), vmut(&mut self.zc));
            self.mf.gemv(1.0, &self.p, &self.zc, 0.0);
            compensated_dot(self.zc.iter(), self.zc.iter()) + h
        } else {
            loading.zm(t, mview(&self.p), vmut(&mut self.mf));
            loading.zx(t, vview(&self.mf)) + h
        }
    }

    /// Mi = Pi·Z', returns F∞ = Z·Pi·Z'.
    fn diffuse_gain(&mut self, loading: &dyn Loading, t: usize) -> f64 {
        match self.collapse {
            DiffuseCollapse::Factor => {
                self.zb = DVector::zeros(self.b.ncols());
                loading.zm(t, mview(&self.b), vmut(&mut self.zb));
                self.mi.gemv(1.0, &self.b, &self.zb, 0.0);
                compensated_dot(self.zb.iter(), self.zb.iter())
            }
            DiffuseCollapse::Covariance => {
                loading.zm(t, mview(&self.pi), vmut(&mut self.mi));
                loading.zx(t, vview(&self.mi))
            }
        }
    }

    fn update_ordinary(&mut self, e: f64, f: f64, h: f64) {
        self.a.axpy(e / f, &self.mf, 1.0);
        if self.square_root {
            // Potter: C <- C - sigma·(C·zc)·zc', sigma = 1/(F + sqrt(F·H))
            let sigma = 1.0 / (f + (f * h).sqrt());
            self.p.ger(-sigma, &self.mf, &self.zc, 1.0);
        } else {
            self.p.ger(-1.0 / f, &self.mf, &self.mf, 1.0);
            symmetrize(&mut self.p);
        }
    }

    fn update_diffuse(&mut self, e: f64, f: f64, fi: f64, h: f64) {
        self.a.axpy(e / fi, &self.mi, 1.0);
        if self.square_root {
            // Pf' = (I - k·Z)·Pf·(I - k·Z)' + k·k'·H with k = Mi/F∞
            let n = self.p.nrows();
            let k = &self.mi / fi;
            let mut w = DMatrix::zeros(n, n + 1);
            w.columns_mut(0, n).copy_from(&self.p);
            w.columns_mut(0, n).ger(-1.0, &k, &self.zc, 1.0);
            w.column_mut(n).copy_from(&(k * h.sqrt()));
            self.p = triangularize(&w);
        } else {
            self.p.ger(f / (fi * fi), &self.mi, &self.mi, 1.0);
            self.p.ger(-1.0 / fi, &self.mi, &self.mf, 1.0);
            self.p.ger(-1.0 / fi, &self.mf, &self.mi, 1.0);
            symmetrize(&mut self.p);
        }
        match self.collapse {
            DiffuseCollapse::Factor => {
                self.b = reduce_factor(&self.b, &self.zb);
            }
            DiffuseCollapse::Covariance => {
                self.pi.ger(-1.0 / fi, &self.mi, &self.mi, 1.0);
                symmetrize(&mut self.pi);
                self.pi_rank -= 1;
                if self.pi_rank == 0 {
                    self.pi.fill(0.0);
                }
            }
        }
    }

    fn predict(&mut self, dynamics: &dyn Dynamics, t: usize) -> Result<()> {
        dynamics.tx(t, vmut(&mut self.a));
        if self.square_root {
            dynamics.tm(t, mmut(&mut self.p));
            let n = self.p.nrows();
            let r = dynamics.innovation_dim();
            if r > 0 {
                let mut w = DMatrix::zeros(n, n + r);
                w.columns_mut(0, n).copy_from(&self.p);
                w.columns_mut(n, r).copy_from(&dynamics.innovation_factor(t));
                self.p = triangularize(&w);
            } else {
                self.p = triangularize(&self.p);
            }
        } else {
            dynamics.tm(t, mmut(&mut self.p));
            dynamics.mt(t, mmut(&mut self.p));
            dynamics.add_v(t, mmut(&mut self.p));
            symmetrize(&mut self.p);
        }
        if self.a.iter().any(|x| !x.is_finite()) {
            return Err(SsfError::SingularSystem(format!(
                "state diverged at t={}",
                t
            )));
        }
        match self.collapse {
            DiffuseCollapse::Factor => {
                if self.b.ncols() > 0 {
                    dynamics.tm(t, mmut(&mut self.b));
                }
            }
            DiffuseCollapse::Covariance => {
                if self.pi_rank > 0 {
                    dynamics.tm(t, mmut(&mut self.pi));
                    dynamics.mt(t, mmut(&mut self.pi));
                    symmetrize(&mut self.pi);
                    if self.pi.amax() <= self.tol {
                        self.pi_rank = 0;
                        self.pi.fill(0.0);
                    }
                }
            }
        }
        Ok(())
    }
}
