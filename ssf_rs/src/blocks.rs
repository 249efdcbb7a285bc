//! Ready-made state blocks for `SystemBuilder`.

use nalgebra::{DMatrix, DVector};

use crate::dynamics::{
    Ar1Dynamics, ConstantDynamics, IntegratedRandomWalkDynamics, RandomWalkDynamics,
};
use crate::error::{Result, SsfError};
use crate::initialization::Initialization;
use crate::loading::{CoordinateLoading, RegressionLoading};
use crate::system::StateBlock;

fn check_variance(name: &str, var: f64) -> Result<()> {
    if !var.is_finite() || var < 0.0 {
        return Err(SsfError::InvalidSystem(format!(
            "{}: innovation variance must be finite and non-negative, got {}",
            name, var
        )));
    }
    Ok(())
}

fn first_coordinate(dim: usize) -> Result<Option<Box<dyn crate::loading::Loading>>> {
    Ok(Some(Box::new(CoordinateLoading::new(0, dim)?)))
}

/// Stationary AR(1) started from its unconditional distribution.
pub fn ar1(rho: f64, var: f64) -> Result<StateBlock> {
    check_variance("ar1", var)?;
    if !rho.is_finite() || rho.abs() >= 1.0 {
        return Err(SsfError::InvalidSystem(format!(
            "ar1: |rho| must be < 1, got {}",
            rho
        )));
    }
    let dynamics = Ar1Dynamics::new(rho, var);
    let initialization = Initialization::stationary(&dynamics)?;
    Ok(StateBlock::new(
        "ar1",
        Box::new(dynamics),
        initialization,
        first_coordinate(1)?,
    ))
}

/// Random walk with a diffuse starting level.
pub fn local_level(var: f64) -> Result<StateBlock> {
    check_variance("local_level", var)?;
    Ok(StateBlock::new(
        "level",
        Box::new(RandomWalkDynamics::new(var)),
        Initialization::diffuse(1),
        first_coordinate(1)?,
    ))
}

/// Known constant level.
pub fn fixed_level(mu: f64) -> Result<StateBlock> {
    if !mu.is_finite() {
        return Err(SsfError::InvalidSystem(format!(
            "fixed_level: level must be finite, got {}",
            mu
        )));
    }
    Ok(StateBlock::new(
        "level",
        Box::new(ConstantDynamics::new(1)),
        Initialization::proper(DVector::from_element(1, mu), DMatrix::zeros(1, 1)),
        first_coordinate(1)?,
    ))
}

/// Diffuse integrated random walk in spline form; the smoothed level of an
/// exactly observed series is the natural cubic spline through the data.
pub fn spline(var: f64) -> Result<StateBlock> {
    check_variance("spline", var)?;
    Ok(StateBlock::new(
        "spline",
        Box::new(IntegratedRandomWalkDynamics::new(var)),
        Initialization::diffuse(2),
        first_coordinate(2)?,
    ))
}

/// Constant diffuse coefficients on the columns of `x`.
pub fn regression(x: DMatrix<f64>) -> Result<StateBlock> {
    if x.iter().any(|v| !v.is_finite()) {
        return Err(SsfError::DataError(
            "regressors must be finite".to_string(),
        ));
    }
    let k = x.ncols();
    Ok(StateBlock::new(
        "regression",
        Box::new(ConstantDynamics::new(k)),
        Initialization::diffuse(k),
        Some(Box::new(RegressionLoading::new(x))),
    ))
}

/// Rename a block, for systems holding several blocks of one kind.
pub fn named(mut block: StateBlock, name: impl Into<String>) -> StateBlock {
    block.name = name.into();
    block
}
