//! Exact-diffuse Kalman filtering and smoothing for linear Gaussian
//! state-space models with a univariate observation:
//!
//!   y_t     = Z_t·a_t + e_t,        e_t ~ N(0, H_t)
//!   a_{t+1} = T_t·a_t + S_t·u_t,    u_t ~ N(0, I)
//!   a_0     ~ N(a0, Pf0 + κ·B·B'),  κ → ∞
//!
//! A system is assembled from `Dynamics`, `Loading` and `Initialization`
//! (directly or through `SystemBuilder`), filtered with `filter` and
//! smoothed with `smooth`. Everything is driven by an explicit `SsfConfig`.

pub mod error;
pub mod types;
pub mod linalg;
pub mod dynamics;
pub mod loading;
pub mod initialization;
pub mod system;
pub mod blocks;
pub mod storage;
pub mod likelihood;
pub mod results;
pub mod filter;
pub mod smoother;
pub mod component;
pub mod forecast;
pub mod simulation;
pub mod batch;

pub use component::{Component, ComponentSeries};
pub use dynamics::Dynamics;
pub use error::{Result, SsfError};
pub use filter::{filter, DiffuseKalmanFilter};
pub use initialization::Initialization;
pub use likelihood::DiffuseLikelihood;
pub use loading::Loading;
pub use results::{FilteringResults, StepKind};
pub use smoother::{smooth, SmoothingResults};
pub use system::{Measurement, MeasurementNoise, StateBlock, StateSpaceSystem, SystemBuilder};
pub use types::{DiffuseCollapse, DiffuseHandling, Numerics, SmoothingMode, SsfConfig};
