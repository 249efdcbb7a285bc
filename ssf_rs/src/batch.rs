//! Rayon-based parallel batch processing.
//!
//! Every pass is independent and owns its storage, so a batch is a plain
//! `par_iter` over series (or systems). Results keep the input order.

use rayon::prelude::*;

use crate::error::Result;
use crate::filter::filter;
use crate::results::FilteringResults;
use crate::smoother::{smooth, SmoothingResults};
use crate::system::StateSpaceSystem;
use crate::types::SsfConfig;

/// Filter many series with one system in parallel.
pub fn batch_filter(
    system: &StateSpaceSystem,
    series: &[Vec<f64>],
    config: &SsfConfig,
) -> Vec<Result<FilteringResults>> {
    series
        .par_iter()
        .map(|y| filter(system, y, config))
        .collect()
}

/// Filter and smooth many series with one system in parallel.
pub fn batch_smooth(
    system: &StateSpaceSystem,
    series: &[Vec<f64>],
    config: &SsfConfig,
) -> Vec<Result<SmoothingResults>> {
    series
        .par_iter()
        .map(|y| {
            let fr = filter(system, y, config)?;
            smooth(system, &fr, config)
        })
        .collect()
}

/// Log-likelihood of one series under many candidate systems, in parallel.
pub fn batch_loglikelihood(
    systems: &[StateSpaceSystem],
    y: &[f64],
    config: &SsfConfig,
) -> Vec<Result<f64>> {
    let config = config.clone().without_storage();
    systems
        .par_iter()
        .map(|system| filter(system, y, &config).map(|fr| fr.loglikelihood()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks;
    use crate::system::{MeasurementNoise, SystemBuilder};
    use approx::assert_abs_diff_eq;

    fn local_level(v: f64) -> StateSpaceSystem {
        SystemBuilder::new()
            .add(blocks::local_level(v).unwrap())
            .noise(MeasurementNoise::Constant(1.0))
            .build()
            .unwrap()
    }

    fn series() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 1.3, f64::NAN, 2.0, 1.7],
            vec![0.2, -0.4, 0.1, 0.6],
            vec![5.0, 4.1, 4.4],
        ]
    }

    #[test]
    fn test_batch_filter_matches_single() {
        let sys = local_level(0.5);
        let cfg = SsfConfig::default();
        let data = series();
        let batch = batch_filter(&sys, &data, &cfg);
        assert_eq!(batch.len(), 3);
        for (y, r) in data.iter().zip(&batch) {
            let direct = filter(&sys, y, &cfg).unwrap();
            let fr = r.as_ref().unwrap();
            assert_eq!(fr.len(), y.len());
            assert_eq!(fr.loglikelihood(), direct.loglikelihood());
        }
    }

    #[test]
    fn test_batch_smooth_matches_single() {
        let sys = local_level(0.5);
        let cfg = SsfConfig::full();
        let data = series();
        let batch = batch_smooth(&sys, &data, &cfg);
        for (y, r) in data.iter().zip(&batch) {
            let direct = smooth(&sys, &filter(&sys, y, &cfg).unwrap(), &cfg).unwrap();
            let sm = r.as_ref().unwrap();
            assert_eq!(sm.component(0), direct.component(0));
            assert_eq!(sm.component_variance(0), direct.component_variance(0));
        }
    }

    #[test]
    fn test_batch_loglikelihood_over_candidates() {
        let y = series().remove(0);
        let cfg = SsfConfig::default();
        let systems: Vec<StateSpaceSystem> = [0.1, 0.5, 2.0].iter().map(|&v| local_level(v)).collect();
        let lls = batch_loglikelihood(&systems, &y, &cfg);
        assert_eq!(lls.len(), 3);
        for (sys, ll) in systems.iter().zip(&lls) {
            let direct = filter(sys, &y, &cfg).unwrap().loglikelihood();
            assert_abs_diff_eq!(*ll.as_ref().unwrap(), direct, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_batch_empty() {
        let sys = local_level(0.5);
        assert!(batch_filter(&sys, &[], &SsfConfig::default()).is_empty());
    }

    #[test]
    fn test_batch_error_handling() {
        let sys = local_level(0.5);
        let data = vec![vec![1.0, 2.0], vec![1.0, f64::INFINITY]];
        let results = batch_filter(&sys, &data, &SsfConfig::default());
        assert!(results[0].is_ok(), "good series should succeed");
        assert!(results[1].is_err(), "infinite observation should fail");
    }
}
