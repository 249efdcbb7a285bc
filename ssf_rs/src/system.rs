use std::ops::Range;

use nalgebra::DMatrix;

use crate::dynamics::{check_dynamics, CompositeDynamics, ConstantDynamics, Dynamics};
use crate::error::{Result, SsfError};
use crate::initialization::Initialization;
use crate::loading::{CompositeLoading, CoordinateLoading, DenseLoading, Loading, RegressionLoading};

/// Variance H_t of the measurement error.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementNoise {
    None,
    Constant(f64),
    /// One variance per period; the last value is reused beyond the end.
    Varying(Vec<f64>),
}

impl MeasurementNoise {
    pub fn variance(&self, pos: usize) -> f64 {
        match self {
            MeasurementNoise::None => 0.0,
            MeasurementNoise::Constant(h) => *h,
            MeasurementNoise::Varying(h) => match h.get(pos) {
                Some(v) => *v,
                None => h.last().copied().unwrap_or(0.0),
            },
        }
    }

    pub fn is_time_invariant(&self) -> bool {
        !matches!(self, MeasurementNoise::Varying(h) if h.len() > 1)
    }

    fn validate(&self) -> Result<()> {
        let bad = match self {
            MeasurementNoise::None => None,
            MeasurementNoise::Constant(h) => Some(*h).filter(|h| !h.is_finite() || *h < 0.0),
            MeasurementNoise::Varying(h) => h.iter().copied().find(|h| !h.is_finite() || *h < 0.0),
        };
        match bad {
            Some(h) => Err(SsfError::InvalidSystem(format!(
                "measurement variance must be finite and non-negative, got {}",
                h
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct Measurement {
    pub loading: Box<dyn Loading>,
    pub noise: MeasurementNoise,
}

impl Measurement {
    pub fn new(loading: Box<dyn Loading>, noise: MeasurementNoise) -> Self {
        Self { loading, noise }
    }

    /// Observation without measurement error.
    pub fn exact(loading: Box<dyn Loading>) -> Self {
        Self::new(loading, MeasurementNoise::None)
    }

    pub fn is_time_invariant(&self) -> bool {
        self.loading.is_time_invariant() && self.noise.is_time_invariant()
    }
}

/// Linear Gaussian state-space system
///
///   y_t     = Z(t)·a_t + e_t,      e_t ~ N(0, H_t)
///   a_{t+1} = T(t)·a_t + S(t)·u_t, u_t ~ N(0, I)
///
/// with a_0 ~ N(a0, Pf0 + kappa·B·B'), kappa -> infinity.
#[derive(Debug)]
pub struct StateSpaceSystem {
    dynamics: Box<dyn Dynamics>,
    initialization: Initialization,
    measurement: Measurement,
    outputs: Vec<(String, Box<dyn Loading>)>,
    blocks: Vec<(String, Range<usize>)>,
    delicate: bool,
}

impl StateSpaceSystem {
    pub fn new(
        dynamics: Box<dyn Dynamics>,
        initialization: Initialization,
        measurement: Measurement,
    ) -> Self {
        let n = dynamics.dim();
        Self {
            dynamics,
            initialization,
            measurement,
            outputs: Vec::new(),
            blocks: vec![("state".to_string(), 0..n)],
            delicate: false,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.dynamics.dim()
    }

    pub fn diffuse_dim(&self) -> usize {
        self.initialization.diffuse_dim()
    }

    pub fn is_time_invariant(&self) -> bool {
        self.dynamics.is_time_invariant() && self.measurement.is_time_invariant()
    }

    pub fn dynamics(&self) -> &dyn Dynamics {
        self.dynamics.as_ref()
    }

    pub fn initialization(&self) -> &Initialization {
        &self.initialization
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    pub fn loading(&self) -> &dyn Loading {
        self.measurement.loading.as_ref()
    }

    pub fn measurement_variance(&self, pos: usize) -> f64 {
        self.measurement.noise.variance(pos)
    }

    /// Register an alternative loading under `name` (e.g. a trend or a
    /// seasonally adjusted series).
    pub fn with_output(mut self, name: impl Into<String>, loading: Box<dyn Loading>) -> Self {
        self.outputs.push((name.into(), loading));
        self
    }

    pub fn output(&self, name: &str) -> Option<&dyn Loading> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, l)| l.as_ref())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }

    /// Request square-root numerics (honored by `Numerics::Auto`).
    pub fn mark_delicate(mut self) -> Self {
        self.delicate = true;
        self
    }

    pub fn is_delicate(&self) -> bool {
        self.delicate
    }

    /// Named state ranges of the blocks the system was assembled from.
    pub fn block_ranges(&self) -> &[(String, Range<usize>)] {
        &self.blocks
    }

    pub fn block(&self, name: &str) -> Option<Range<usize>> {
        self.blocks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.state_dim();
        check_dynamics(self.dynamics.as_ref(), 0)?;
        if self.initialization.dim() != n {
            return Err(SsfError::DimensionMismatch {
                expected: n,
                got: self.initialization.dim(),
            });
        }
        self.initialization.validate()?;
        if self.loading().dim() != n {
            return Err(SsfError::DimensionMismatch {
                expected: n,
                got: self.loading().dim(),
            });
        }
        self.measurement.noise.validate()?;
        for (name, l) in &self.outputs {
            if l.dim() != n {
                return Err(SsfError::InvalidSystem(format!(
                    "output '{}' has dimension {}, state has {}",
                    name,
                    l.dim(),
                    n
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Composite construction
// ---------------------------------------------------------------------------

/// One independent part of a composite state vector.
#[derive(Debug)]
pub struct StateBlock {
    pub name: String,
    pub dynamics: Box<dyn Dynamics>,
    pub initialization: Initialization,
    /// Contribution to the observation; `None` for unobserved blocks.
    pub loading: Option<Box<dyn Loading>>,
}

impl StateBlock {
    pub fn new(
        name: impl Into<String>,
        dynamics: Box<dyn Dynamics>,
        initialization: Initialization,
        loading: Option<Box<dyn Loading>>,
    ) -> Self {
        Self {
            name: name.into(),
            dynamics,
            initialization,
            loading,
        }
    }

    pub fn dim(&self) -> usize {
        self.dynamics.dim()
    }
}

/// Direct sum of state blocks whose loadings add up to the measurement.
#[derive(Debug, Default)]
pub struct SystemBuilder {
    blocks: Vec<StateBlock>,
    noise: Option<MeasurementNoise>,
    outputs: Vec<(String, Vec<String>)>,
    delicate: bool,
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, block: StateBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Regression block: identity dynamics, diffuse coefficients, loading = row t of `x`.
    pub fn regression(self, name: impl Into<String>, x: DMatrix<f64>) -> Self {
        let k = x.ncols();
        self.add(StateBlock::new(
            name,
            Box::new(ConstantDynamics::new(k)),
            Initialization::diffuse(k),
            Some(Box::new(RegressionLoading::new(x))),
        ))
    }

    pub fn noise(mut self, noise: MeasurementNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    /// Named output summing the loadings of the listed blocks.
    pub fn output(mut self, name: impl Into<String>, blocks: &[&str]) -> Self {
        self.outputs
            .push((name.into(), blocks.iter().map(|s| s.to_string()).collect()));
        self
    }

    pub fn delicate(mut self) -> Self {
        self.delicate = true;
        self
    }

    pub fn build(self) -> Result<StateSpaceSystem> {
        if self.blocks.is_empty() {
            return Err(SsfError::InvalidSystem("no state blocks".to_string()));
        }
        let mut ranges = Vec::with_capacity(self.blocks.len());
        let mut start = 0;
        for block in &self.blocks {
            if block.initialization.dim() != block.dim() {
                return Err(SsfError::InvalidSystem(format!(
                    "block '{}': initialization has dimension {}, dynamics {}",
                    block.name,
                    block.initialization.dim(),
                    block.dim()
                )));
            }
            ranges.push((block.name.clone(), start..start + block.dim()));
            start += block.dim();
        }
        let n = start;

        let mut named = Vec::with_capacity(self.outputs.len());
        for (name, members) in &self.outputs {
            let mut parts: Vec<(usize, Box<dyn Loading>)> = Vec::new();
            for member in members {
                let i = ranges
                    .iter()
                    .position(|(b, _)| b == member)
                    .ok_or_else(|| {
                        SsfError::InvalidSystem(format!("output '{}': unknown block '{}'", name, member))
                    })?;
                let loading = output_loading(&self.blocks[i])?;
                parts.push((ranges[i].1.start, loading));
            }
            named.push((name.clone(), CompositeLoading::new(parts, n)?));
        }

        let inits: Vec<Initialization> = self
            .blocks
            .iter()
            .map(|b| b.initialization.clone())
            .collect();
        let mut dynamics = Vec::with_capacity(self.blocks.len());
        let mut parts: Vec<(usize, Box<dyn Loading>)> = Vec::new();
        for (block, (_, range)) in self.blocks.into_iter().zip(ranges.iter()) {
            dynamics.push(block.dynamics);
            if let Some(l) = block.loading {
                parts.push((range.start, l));
            }
        }

        let loading = CompositeLoading::new(parts, n)?;
        let noise = self.noise.unwrap_or(MeasurementNoise::None);
        let mut system = StateSpaceSystem::new(
            Box::new(CompositeDynamics::new(dynamics)),
            Initialization::block_diagonal(&inits),
            Measurement::new(Box::new(loading), noise),
        );
        system.blocks = ranges;
        system.delicate = self.delicate;
        for (name, l) in named {
            system = system.with_output(name, Box::new(l));
        }
        system.validate()?;
        Ok(system)
    }
}

/// The loading a block contributes to named outputs: its measurement
/// loading materialized, or its first coordinate for unobserved blocks.
fn output_loading(block: &StateBlock) -> Result<Box<dyn Loading>> {
    match &block.loading {
        Some(l) if l.is_time_invariant() => Ok(Box::new(DenseLoading::new(l.row(0)))),
        Some(_) => Err(SsfError::InvalidSystem(format!(
            "block '{}' has a time-varying loading and cannot be part of a named output",
            block.name
        ))),
        None => Ok(Box::new(CoordinateLoading::new(0, block.dim())?)),
    }
}
