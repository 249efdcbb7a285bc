//! A diffuse integrated random walk observed exactly at a few knots is
//! smoothed into the natural cubic spline through them.

use approx::assert_abs_diff_eq;
use ssf_rs::blocks;
use ssf_rs::{
    filter, smooth, DiffuseCollapse, Numerics, SmoothingMode, SsfConfig, StateSpaceSystem,
    SystemBuilder,
};

fn load_fixture() -> serde_json::Value {
    let path = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/spline_reference.json"
    );
    let data = std::fs::read_to_string(path).expect("fixture file not found");
    serde_json::from_str(&data).expect("invalid JSON")
}

fn floats(v: &serde_json::Value) -> Vec<f64> {
    v.as_array()
        .unwrap()
        .iter()
        .map(|x| x.as_f64().unwrap())
        .collect()
}

fn spline_system() -> StateSpaceSystem {
    SystemBuilder::new()
        .add(blocks::spline(1.0).unwrap())
        .build()
        .unwrap()
}

fn knot_series(fixture: &serde_json::Value) -> Vec<f64> {
    let n = fixture["n"].as_u64().unwrap() as usize;
    let mut y = vec![f64::NAN; n];
    for (k, v) in fixture["knots"]
        .as_array()
        .unwrap()
        .iter()
        .zip(floats(&fixture["values"]))
    {
        y[k.as_u64().unwrap() as usize] = v;
    }
    y
}

fn check_against_fixture(config: &SsfConfig) {
    let fixture = load_fixture();
    let sys = spline_system();
    let y = knot_series(&fixture);
    let fr = filter(&sys, &y, config).unwrap();
    assert_eq!(
        fr.diffuse_end(),
        fixture["diffuse_end"].as_u64().unwrap() as usize
    );
    assert!(fr.is_diffuse_identified());

    let sm = smooth(&sys, &fr, config).unwrap();
    let level = sm.component(0);
    for (t, (got, want)) in level.iter().zip(floats(&fixture["level"])).enumerate() {
        assert!((got - want).abs() < 1e-9, "level at t={}: {} vs {}", t, got, want);
    }
    if let Some(var) = sm.component_variance(0) {
        for (t, (got, want)) in var.iter().zip(floats(&fixture["level_variance"])).enumerate() {
            assert!((got - want).abs() < 1e-8, "variance at t={}: {} vs {}", t, got, want);
        }
    }
}

#[test]
fn test_smoothed_level_is_natural_spline() {
    let fixture = load_fixture();
    let sys = spline_system();
    let y = knot_series(&fixture);
    let cfg = SsfConfig::default();
    let sm = smooth(&sys, &filter(&sys, &y, &cfg).unwrap(), &cfg).unwrap();
    for (t, (got, want)) in sm
        .component(0)
        .iter()
        .zip(floats(&fixture["natural_spline"]))
        .enumerate()
    {
        assert!((got - want).abs() < 1e-9, "t={}: {} vs {}", t, got, want);
    }
}

#[test]
fn test_spline_full_smoother() {
    check_against_fixture(&SsfConfig::full());
}

#[test]
fn test_spline_fast_smoother() {
    check_against_fixture(&SsfConfig::default().with_smoothing(SmoothingMode::Fast));
}

#[test]
fn test_spline_covariance_collapse() {
    check_against_fixture(&SsfConfig::full().with_collapse(DiffuseCollapse::Covariance));
}

#[test]
fn test_spline_square_root() {
    check_against_fixture(&SsfConfig::full().with_numerics(Numerics::SquareRoot));
}

#[test]
fn test_spline_knots_are_exact() {
    let fixture = load_fixture();
    let sys = spline_system();
    let y = knot_series(&fixture);
    let cfg = SsfConfig::full();
    let sm = smooth(&sys, &filter(&sys, &y, &cfg).unwrap(), &cfg).unwrap();
    let var = sm.component_variance(0).unwrap();
    for (t, yt) in y.iter().enumerate().filter(|(_, v)| !v.is_nan()) {
        assert_abs_diff_eq!(sm.component(0)[t], *yt, epsilon = 1e-9);
        assert_abs_diff_eq!(var[t], 0.0, epsilon = 1e-9);
    }
}

#[test]
fn test_spline_loglikelihood() {
    let fixture = load_fixture();
    let sys = spline_system();
    let y = knot_series(&fixture);
    let fr = filter(&sys, &y, &SsfConfig::default()).unwrap();
    assert_eq!(
        fr.likelihood().n_obs(),
        fixture["n_obs"].as_u64().unwrap() as usize
    );
    assert_eq!(fr.likelihood().n_diffuse(), 2);
    assert_abs_diff_eq!(
        fr.loglikelihood(),
        fixture["loglikelihood"].as_f64().unwrap(),
        epsilon = 1e-9
    );
}
