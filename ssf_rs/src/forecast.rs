use nalgebra::DMatrix;

use crate::error::{Result, SsfError};
use crate::linalg::{mmut, mview, symmetrize, vmut, vview};
use crate::results::{FilteringResults, StepKind};
use crate::system::StateSpaceSystem;

/// H-step ahead forecast result.
#[derive(Debug, Clone)]
pub struct ForecastResult {
    /// Forecast means E[y_{N+h}] for h = 0..steps.
    pub mean: Vec<f64>,
    /// Forecast variances Var[y_{N+h}].
    pub variance: Vec<f64>,
    /// Lower confidence interval bounds.
    pub ci_lower: Vec<f64>,
    /// Upper confidence interval bounds.
    pub ci_upper: Vec<f64>,
}

/// Residual diagnostics output.
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    /// Raw prediction errors e_t (NaN on missing steps).
    pub residuals: Vec<f64>,
    /// e_t / sqrt(F_t) on ordinary steps, NaN elsewhere.
    pub standardized_residuals: Vec<f64>,
}

/// Forecast the observations following the filtered sample.
///
/// Starts from the final prediction a_N, P_N of the filter:
///   y_hat_h = Z·a_h
///   F_h     = Z·P_h·Z' + H
///   a_{h+1} = T·a_h
///   P_{h+1} = T·P_h·T' + V
pub fn forecast(
    system: &StateSpaceSystem,
    filtering: &FilteringResults,
    steps: usize,
    alpha: f64,
) -> Result<ForecastResult> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(SsfError::DataError(format!(
            "confidence level alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    if filtering.final_diffuse_rank() > 0 {
        return Err(SsfError::DataError(format!(
            "cannot forecast: {} diffuse direction(s) not identified by the sample",
            filtering.final_diffuse_rank()
        )));
    }

    let z_alpha = z_score(1.0 - alpha / 2.0);
    let dynamics = system.dynamics();
    let loading = system.loading();

    let mut a = filtering.final_state().clone();
    let mut p: DMatrix<f64> = filtering.final_covariance().clone();

    let mut mean = Vec::with_capacity(steps);
    let mut variance = Vec::with_capacity(steps);
    let mut ci_lower = Vec::with_capacity(steps);
    let mut ci_upper = Vec::with_capacity(steps);

    for h in 0..steps {
        let pos = filtering.len() + h;
        let y_hat = loading.zx(pos, vview(&a));
        let f_h = loading.zvz(pos, mview(&p)) + system.measurement_variance(pos);
        if f_h < -filtering.zero_tolerance() {
            return Err(SsfError::NegativeVariance { t: pos, value: f_h });
        }
        let f_h = f_h.max(0.0);
        let se = f_h.sqrt();
        mean.push(y_hat);
        variance.push(f_h);
        ci_lower.push(y_hat - z_alpha * se);
        ci_upper.push(y_hat + z_alpha * se);

        dynamics.tx(pos, vmut(&mut a));
        dynamics.tm(pos, mmut(&mut p));
        dynamics.mt(pos, mmut(&mut p));
        dynamics.add_v(pos, mmut(&mut p));
        symmetrize(&mut p);
    }

    Ok(ForecastResult {
        mean,
        variance,
        ci_lower,
        ci_upper,
    })
}

/// Raw and standardized prediction errors of a filter pass.
pub fn compute_residuals(filtering: &FilteringResults) -> ResidualOutput {
    let standardized = filtering
        .kinds()
        .iter()
        .zip(filtering.errors().iter().zip(filtering.error_variances()))
        .map(|(kind, (&e, &f))| match kind {
            StepKind::Ordinary if f > 0.0 => e / f.sqrt(),
            _ => f64::NAN,
        })
        .collect();

    ResidualOutput {
        residuals: filtering.errors().to_vec(),
        standardized_residuals: standardized,
    }
}

/// Approximate inverse normal CDF using rational approximation (Abramowitz & Stegun 26.2.23).
fn z_score(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if (p - 0.5).abs() < 1e-15 {
        return 0.0;
    }

    let (sign, q) = if p < 0.5 { (-1.0, p) } else { (1.0, 1.0 - p) };

    let t = (-2.0 * q.ln()).sqrt();

    // Rational approximation coefficients
    let c0 = 2.515517;
    let c1 = 0.802853;
    let c2 = 0.010328;
    let d1 = 1.432788;
    let d2 = 0.189269;
    let d3 = 0.001308;

    let x = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

    sign * x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks;
    use crate::filter::filter;
    use crate::system::{MeasurementNoise, SystemBuilder};
    use crate::types::SsfConfig;
    use approx::assert_abs_diff_eq;

    fn local_level(v: f64, h: f64) -> StateSpaceSystem {
        SystemBuilder::new()
            .add(blocks::local_level(v).unwrap())
            .noise(MeasurementNoise::Constant(h))
            .build()
            .unwrap()
    }

    const Y: [f64; 6] = [1.0, 1.5, 0.8, f64::NAN, 1.9, 2.3];

    #[test]
    fn test_z_score_standard() {
        assert!((z_score(0.975) - 1.96).abs() < 0.01);
        assert!((z_score(0.5)).abs() < 1e-10);
        assert!((z_score(0.025) + 1.96).abs() < 0.01);
    }

    #[test]
    fn test_local_level_forecast() {
        // flat mean, variance P_N + h·v + H
        let (v, h) = (0.5, 0.3);
        let sys = local_level(v, h);
        let fr = filter(&sys, &Y, &SsfConfig::default()).unwrap();
        let fc = forecast(&sys, &fr, 4, 0.05).unwrap();
        let level = fr.final_state()[0];
        let p = fr.final_covariance()[(0, 0)];
        for i in 0..4 {
            assert_abs_diff_eq!(fc.mean[i], level, epsilon = 1e-12);
            assert_abs_diff_eq!(fc.variance[i], p + i as f64 * v + h, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_ar1_forecast_decays() {
        let sys = SystemBuilder::new()
            .add(blocks::ar1(0.8, 1.0).unwrap())
            .build()
            .unwrap();
        let y = [0.5, 1.2, 2.0];
        let fr = filter(&sys, &y, &SsfConfig::default()).unwrap();
        let fc = forecast(&sys, &fr, 5, 0.05).unwrap();
        // a_N = 0.8·y_{N-1}
        assert_abs_diff_eq!(fc.mean[0], 1.6, epsilon = 1e-12);
        for i in 1..5 {
            assert_abs_diff_eq!(fc.mean[i], 0.8 * fc.mean[i - 1], epsilon = 1e-12);
            assert!(fc.variance[i] >= fc.variance[i - 1]);
            assert!(fc.variance[i] < 1.0 / (1.0 - 0.64));
        }
    }

    #[test]
    fn test_forecast_ci_symmetric() {
        let sys = local_level(0.5, 0.3);
        let fr = filter(&sys, &Y, &SsfConfig::default()).unwrap();
        let fc = forecast(&sys, &fr, 3, 0.1).unwrap();
        for i in 0..3 {
            let lower = fc.mean[i] - fc.ci_lower[i];
            let upper = fc.ci_upper[i] - fc.mean[i];
            assert_abs_diff_eq!(lower, upper, epsilon = 1e-10);
            assert!(lower > 0.0);
        }
    }

    #[test]
    fn test_forecast_zero_steps() {
        let sys = local_level(0.5, 0.3);
        let fr = filter(&sys, &Y, &SsfConfig::default()).unwrap();
        let fc = forecast(&sys, &fr, 0, 0.05).unwrap();
        assert!(fc.mean.is_empty());
    }

    #[test]
    fn test_forecast_refused() {
        let sys = local_level(0.5, 0.3);
        let fr = filter(&sys, &[f64::NAN, f64::NAN], &SsfConfig::default()).unwrap();
        assert!(matches!(forecast(&sys, &fr, 2, 0.05), Err(SsfError::DataError(_))));

        let fr = filter(&sys, &Y, &SsfConfig::default()).unwrap();
        assert!(forecast(&sys, &fr, 2, 0.0).is_err());
        assert!(forecast(&sys, &fr, 2, 1.5).is_err());
    }

    #[test]
    fn test_forecast_reports_negative_variance() {
        use crate::loading::CoordinateLoading;
        use crate::system::Measurement;

        let fr = filter(&local_level(0.5, 0.3), &Y, &SsfConfig::default()).unwrap();
        let broken = StateSpaceSystem::new(
            Box::new(crate::dynamics::RandomWalkDynamics::new(0.5)),
            crate::initialization::Initialization::diffuse(1),
            Measurement::new(
                Box::new(CoordinateLoading::new(0, 1).unwrap()),
                MeasurementNoise::Constant(-50.0),
            ),
        );
        match forecast(&broken, &fr, 3, 0.05) {
            Err(SsfError::NegativeVariance { t, value }) => {
                assert_eq!(t, Y.len());
                assert!(value < 0.0);
            }
            other => panic!("expected NegativeVariance, got {:?}", other.map(|f| f.variance)),
        }
    }

    #[test]
    fn test_residuals() {
        let sys = local_level(0.5, 0.3);
        let fr = filter(&sys, &Y, &SsfConfig::default()).unwrap();
        let res = compute_residuals(&fr);
        assert_eq!(res.residuals.len(), Y.len());
        assert_eq!(res.standardized_residuals.len(), Y.len());
        // diffuse first step and missing step
        assert!(res.standardized_residuals[0].is_nan());
        assert!(res.residuals[3].is_nan());
        assert!(res.standardized_residuals[3].is_nan());
        let f = fr.error_variances()[1];
        assert_abs_diff_eq!(
            res.standardized_residuals[1],
            res.residuals[1] / f.sqrt(),
            epsilon = 1e-12
        );
    }
}
