//! Draws from a state-space system.
//!
//! The initial state is a0 + chol(Pf0)·z; the diffuse part is set to zero.

use nalgebra::DVector;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::Result;
use crate::linalg::{cholesky_psd, vmut, vview};
use crate::system::StateSpaceSystem;

const FACTOR_TOLERANCE: f64 = 1e-12;

/// One simulated path.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// α_t for t = 0..n.
    pub states: Vec<DVector<f64>>,
    /// y_t = Z_t·α_t + ε_t.
    pub observations: Vec<f64>,
}

fn normals<R: Rng + ?Sized>(rng: &mut R, k: usize) -> DVector<f64> {
    DVector::from_fn(k, |_, _| rng.sample(StandardNormal))
}

/// Simulate `n` periods of states and observations.
pub fn simulate<R: Rng + ?Sized>(
    system: &StateSpaceSystem,
    n: usize,
    rng: &mut R,
) -> Result<Simulation> {
    system.validate()?;
    let dynamics = system.dynamics();
    let loading = system.loading();
    let init = system.initialization();

    let mut alpha = init.a0.clone();
    let c0 = cholesky_psd(&init.pf0, FACTOR_TOLERANCE)?;
    alpha.gemv(1.0, &c0, &normals(rng, c0.ncols()), 1.0);

    debug!(
        periods = n,
        state_dim = system.state_dim(),
        diffuse_dim = system.diffuse_dim(),
        "simulating"
    );

    let mut states = Vec::with_capacity(n);
    let mut observations = Vec::with_capacity(n);
    for t in 0..n {
        let h = system.measurement_variance(t);
        let eps: f64 = rng.sample(StandardNormal);
        observations.push(loading.zx(t, vview(&alpha)) + h.sqrt() * eps);
        states.push(alpha.clone());

        dynamics.tx(t, vmut(&mut alpha));
        if dynamics.innovation_dim() > 0 {
            let s = dynamics.innovation_factor(t);
            alpha.gemv(1.0, &s, &normals(rng, s.ncols()), 1.0);
        }
    }

    Ok(Simulation {
        states,
        observations,
    })
}

impl StateSpaceSystem {
    /// Simulated observations of length `n`.
    pub fn random<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<f64>> {
        simulate(self, n, rng).map(|s| s.observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks;
    use crate::system::{MeasurementNoise, SystemBuilder};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn level_plus_ar1() -> StateSpaceSystem {
        SystemBuilder::new()
            .add(blocks::fixed_level(3.0).unwrap())
            .add(blocks::ar1(0.5, 1.0).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_observations_follow_states() {
        let sys = level_plus_ar1();
        let mut rng = StdRng::seed_from_u64(7);
        let sim = simulate(&sys, 50, &mut rng).unwrap();
        assert_eq!(sim.states.len(), 50);
        for (a, y) in sim.states.iter().zip(&sim.observations) {
            // no measurement noise: y = level + cycle
            assert!((a[0] - 3.0).abs() < 1e-12);
            assert!((a[0] + a[1] - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_seed_reproducible() {
        let sys = SystemBuilder::new()
            .add(blocks::local_level(0.5).unwrap())
            .noise(MeasurementNoise::Constant(1.0))
            .build()
            .unwrap();
        let a = sys.random(20, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = sys.random(20, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
        // diffuse level starts at zero
        let sim = simulate(&sys, 1, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(sim.states[0][0], 0.0);
    }
}
