//! Components of the smoothed state: a named range of coordinates read
//! through a loading, e.g. the trend of a trend + cycle model.

use std::ops::Range;

use crate::error::{Result, SsfError};
use crate::loading::{CoordinateLoading, Loading};
use crate::smoother::SmoothingResults;
use crate::system::StateSpaceSystem;

#[derive(Debug)]
pub struct Component {
    pub name: String,
    pub range: Range<usize>,
    /// Loading on the coordinates of `range`; the first coordinate when `None`.
    pub loading: Option<Box<dyn Loading>>,
}

impl Component {
    pub fn new(name: impl Into<String>, range: Range<usize>) -> Self {
        Self {
            name: name.into(),
            range,
            loading: None,
        }
    }

    pub fn with_loading(mut self, loading: Box<dyn Loading>) -> Result<Self> {
        if loading.dim() != self.range.len() {
            return Err(SsfError::DimensionMismatch {
                expected: self.range.len(),
                got: loading.dim(),
            });
        }
        self.loading = Some(loading);
        Ok(self)
    }

    /// Component over the state range of block `name`.
    pub fn from_block(system: &StateSpaceSystem, name: &str) -> Result<Self> {
        system
            .block(name)
            .map(|range| Self::new(name, range))
            .ok_or_else(|| SsfError::InvalidSystem(format!("unknown block '{}'", name)))
    }

    fn check(&self, dim: usize) -> Result<()> {
        if self.range.is_empty() || self.range.end > dim {
            return Err(SsfError::DimensionMismatch {
                expected: dim,
                got: self.range.end,
            });
        }
        Ok(())
    }
}

/// Values of a component over time, with standard errors when the smoother
/// produced covariances.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSeries {
    pub values: Vec<f64>,
    pub stdevs: Option<Vec<f64>>,
}

impl ComponentSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SmoothingResults {
    /// Evaluate `component` at every period.
    pub fn extract(&self, component: &Component) -> Result<ComponentSeries> {
        component.check(self.dim())?;
        let s = component.range.start;
        let k = component.range.len();
        let default;
        let loading: &dyn Loading = match &component.loading {
            Some(l) => l.as_ref(),
            None => {
                default = CoordinateLoading::new(0, k)?;
                &default
            }
        };
        Ok(self.evaluate(loading, s, k))
    }

    /// Evaluate the named output registered on `system`.
    pub fn output(&self, system: &StateSpaceSystem, name: &str) -> Result<ComponentSeries> {
        let loading = system
            .output(name)
            .ok_or_else(|| SsfError::InvalidSystem(format!("unknown output '{}'", name)))?;
        self.check_loading(loading)?;
        Ok(self.evaluate(loading, 0, self.dim()))
    }

    /// Smoothed signal Z_t·â_t.
    pub fn signal(&self, system: &StateSpaceSystem) -> Result<ComponentSeries> {
        self.check_loading(system.loading())?;
        Ok(self.evaluate(system.loading(), 0, self.dim()))
    }

    fn check_loading(&self, loading: &dyn Loading) -> Result<()> {
        if loading.dim() != self.dim() {
            return Err(SsfError::DimensionMismatch {
                expected: self.dim(),
                got: loading.dim(),
            });
        }
        Ok(())
    }

    fn evaluate(&self, loading: &dyn Loading, s: usize, k: usize) -> ComponentSeries {
        let values = (0..self.len())
            .map(|t| {
                self.state(t)
                    .map_or(f64::NAN, |a| loading.zx(t, a.rows(s, k)))
            })
            .collect();
        let stdevs = self.has_variances().then(|| {
            (0..self.len())
                .map(|t| {
                    self.variance(t).map_or(f64::NAN, |v| {
                        loading.zvz(t, v.view((s, s), (k, k))).max(0.0).sqrt()
                    })
                })
                .collect()
        });
        ComponentSeries { values, stdevs }
    }
}
