use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::initialization::Initialization;
use crate::likelihood::{diffuse_contribution, ordinary_contribution, DiffuseLikelihood};
use crate::storage::{MatrixStore, VectorStore};

/// What the filter did with one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// NaN observation: prediction only.
    Missing,
    /// Informative step of the diffuse phase (F∞ > 0).
    Diffuse,
    /// Standard Kalman update.
    Ordinary,
    /// Observation with (numerically) zero variance; handled like a missing one.
    Degenerate,
}

/// Output of one forward pass of the diffuse Kalman filter.
///
/// All states and covariances are one-step predictions: `predicted_state(t)`
/// is a_{t|t-1}, computed before y_t is used.
#[derive(Debug, Clone)]
pub struct FilteringResults {
    pub(crate) kinds: Vec<StepKind>,
    pub(crate) e: Vec<f64>,
    pub(crate) f: Vec<f64>,
    pub(crate) fi: Vec<f64>,
    pub(crate) ranks: Vec<usize>,
    pub(crate) contributions: Vec<f64>,
    /// P·Z' (proper part) for every step.
    pub(crate) m: VectorStore,
    /// Pi·Z' for the steps of the diffuse phase.
    pub(crate) mi: VectorStore,
    pub(crate) states: Option<VectorStore>,
    pub(crate) covariances: Option<MatrixStore>,
    pub(crate) factors: Option<MatrixStore>,
    pub(crate) diffuse_covariances: MatrixStore,
    pub(crate) initialization: Initialization,
    pub(crate) final_state: DVector<f64>,
    pub(crate) final_covariance: DMatrix<f64>,
    pub(crate) final_diffuse: DMatrix<f64>,
    pub(crate) final_rank: usize,
    pub(crate) diffuse_end: usize,
    pub(crate) likelihood: DiffuseLikelihood,
    pub(crate) square_root: bool,
    pub(crate) zero_tolerance: f64,
}

impl FilteringResults {
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn kind(&self, t: usize) -> StepKind {
        self.kinds[t]
    }

    pub fn kinds(&self) -> &[StepKind] {
        &self.kinds
    }

    /// Prediction errors e_t (NaN on missing steps).
    pub fn errors(&self) -> &[f64] {
        &self.e
    }

    /// Prediction-error variances F_t (NaN on missing steps).
    pub fn error_variances(&self) -> &[f64] {
        &self.f
    }

    /// Diffuse variances F∞_t (NaN outside the diffuse phase and on missing steps).
    pub fn diffuse_variances(&self) -> &[f64] {
        &self.fi
    }

    /// Log-likelihood contributions, without the 2π constant.
    pub fn contributions(&self) -> &[f64] {
        &self.contributions
    }

    /// Rank of the diffuse covariance before step t.
    pub fn diffuse_rank(&self, t: usize) -> usize {
        self.ranks[t]
    }

    /// First period after the diffuse phase.
    pub fn diffuse_end(&self) -> usize {
        self.diffuse_end
    }

    /// Whether the diffuse part was fully identified by the sample.
    pub fn is_diffuse_identified(&self) -> bool {
        self.final_rank == 0
    }

    pub fn is_square_root(&self) -> bool {
        self.square_root
    }

    /// Tolerance the pass used to tell zero from negative variances.
    pub fn zero_tolerance(&self) -> f64 {
        self.zero_tolerance
    }

    pub fn predicted_state(&self, t: usize) -> Option<DVector<f64>> {
        self.states.as_ref().and_then(|s| s.get(t))
    }

    /// Proper part of the predicted covariance, read through the stored
    /// square-root factor when the filter ran square-root numerics.
    pub fn predicted_covariance(&self, t: usize) -> Option<DMatrix<f64>> {
        if let Some(c) = &self.covariances {
            return c.get(t);
        }
        self.factors
            .as_ref()
            .and_then(|s| s.get(t))
            .map(|c| &c * c.transpose())
    }

    pub fn has_covariances(&self) -> bool {
        self.covariances.is_some() || self.factors.is_some()
    }

    /// Lower factor C_t with P_t = C_t·C_t' (square-root numerics only).
    pub fn covariance_factor(&self, t: usize) -> Option<DMatrix<f64>> {
        self.factors.as_ref().and_then(|s| s.get(t))
    }

    /// Pi_t during the diffuse phase.
    pub fn diffuse_covariance(&self, t: usize) -> Option<DMatrix<f64>> {
        self.diffuse_covariances.get(t)
    }

    /// M_t = P_t·Z_t'.
    pub fn gain(&self, t: usize) -> Option<DVector<f64>> {
        self.m.get(t)
    }

    /// Mi_t = Pi_t·Z_t'.
    pub fn diffuse_gain(&self, t: usize) -> Option<DVector<f64>> {
        self.mi.get(t)
    }

    /// Predicted path of state coordinate `i` (NaN where not stored).
    pub fn state_component(&self, i: usize) -> Vec<f64> {
        self.states
            .as_ref()
            .map(|s| s.component(i))
            .unwrap_or_default()
    }

    /// The initialization actually used (after the approximate-diffuse transform).
    pub fn initialization(&self) -> &Initialization {
        &self.initialization
    }

    /// a_{N|N-1}
    pub fn final_state(&self) -> &DVector<f64> {
        &self.final_state
    }

    /// Proper part of P_{N|N-1}.
    pub fn final_covariance(&self) -> &DMatrix<f64> {
        &self.final_covariance
    }

    /// Diffuse part of P_{N|N-1}.
    pub fn final_diffuse_covariance(&self) -> &DMatrix<f64> {
        &self.final_diffuse
    }

    pub fn final_diffuse_rank(&self) -> usize {
        self.final_rank
    }

    pub fn likelihood(&self) -> &DiffuseLikelihood {
        &self.likelihood
    }

    pub fn loglikelihood(&self) -> f64 {
        self.likelihood.loglikelihood()
    }

    /// Re-assemble the likelihood from the per-step quantities of `range`.
    pub fn likelihood_over(&self, range: Range<usize>) -> DiffuseLikelihood {
        let mut lik = DiffuseLikelihood::new();
        for t in range.filter(|&t| t < self.len()) {
            match self.kinds[t] {
                StepKind::Ordinary => lik.add_ordinary(self.e[t], self.f[t]),
                StepKind::Diffuse => lik.add_diffuse(self.fi[t]),
                StepKind::Missing | StepKind::Degenerate => {}
            }
        }
        lik
    }

    /// Correct every stored output for observations that were divided by
    /// `factor` before filtering.
    pub fn rescale(&mut self, factor: f64) {
        let f2 = factor * factor;
        for e in &mut self.e {
            *e *= factor;
        }
        for f in &mut self.f {
            *f *= f2;
        }
        for (c, kind) in self.contributions.iter_mut().zip(self.kinds.iter()) {
            if *kind == StepKind::Ordinary {
                *c -= factor.ln();
            }
        }
        self.m.rescale(f2);
        if let Some(s) = &mut self.states {
            s.rescale(factor);
        }
        if let Some(c) = &mut self.covariances {
            c.rescale(f2);
        }
        if let Some(c) = &mut self.factors {
            c.rescale(factor);
        }
        self.initialization.a0 *= factor;
        self.initialization.pf0 *= f2;
        self.final_state *= factor;
        self.final_covariance *= f2;
        self.likelihood.rescale(factor);
    }
}

/// Contribution of step `kind` to the log-likelihood, without the 2π constant.
pub(crate) fn contribution(kind: StepKind, e: f64, f: f64, fi: f64) -> f64 {
    match kind {
        StepKind::Ordinary => ordinary_contribution(e, f),
        StepKind::Diffuse => diffuse_contribution(fi),
        StepKind::Missing | StepKind::Degenerate => 0.0,
    }
}
