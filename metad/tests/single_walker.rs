#![allow(missing_docs)]

use float_cmp::assert_approx_eq;
use metad::bias::MetaBias;
use metad::colvar::{Colvar, Value};
use metad::hill::{calc_hills, calc_hills_force};
use metad::params::MetaParams;
use metad::proxy::{EngineProxy, StdProxy};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::io::Write;

/// Proxy with a unit Boltzmann constant, so bias temperatures are read
/// directly in energy units.
struct UnitProxy;

impl EngineProxy for UnitProxy {
    fn boltzmann(&self) -> f64 {
        1.0
    }

    fn timestep(&self) -> f64 {
        1.0
    }

    fn target_temperature(&self) -> f64 {
        300.0
    }
}

fn colvars_one() -> Vec<Colvar> {
    vec![Colvar::scalar("d", 0.1, -2.0, 2.0).unwrap()]
}

fn analytic_params() -> MetaParams {
    MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        gaussian_sigmas: Some(vec![0.2]),
        use_grids: false,
        ..MetaParams::default()
    }
}

#[test]
fn single_hill_energy_and_force() {
    let mut bias = MetaBias::new(
        "mtd",
        colvars_one(),
        analytic_params(),
        Box::new(StdProxy::default()),
    )
    .unwrap();
    bias.update(&[Value::Scalar(0.0)]).unwrap();

    let energy = bias.energy_at(&[Value::Scalar(0.2)]);
    assert_approx_eq!(f64, energy, (-0.5_f64).exp(), epsilon = 1e-12);

    let forces = bias.forces_at(&[Value::Scalar(0.2)]);
    // W · exp(-1/2) · (2·0.2) / (2·0.2²)
    assert_approx_eq!(
        f64,
        forces[0].components()[0],
        5.0 * (-0.5_f64).exp(),
        epsilon = 1e-12
    );
}

#[test]
fn force_is_the_negative_energy_gradient() {
    let mut bias = MetaBias::new(
        "mtd",
        colvars_one(),
        analytic_params(),
        Box::new(StdProxy::default()),
    )
    .unwrap();
    bias.update(&[Value::Scalar(0.1)]).unwrap();
    bias.update(&[Value::Scalar(-0.3)]).unwrap();

    let eps = 1e-6;
    for x in [-0.5, -0.1, 0.0, 0.2, 0.45] {
        let minus = bias.energy_at(&[Value::Scalar(x - eps)]);
        let plus = bias.energy_at(&[Value::Scalar(x + eps)]);
        let numeric = -(plus - minus) / (2.0 * eps);
        let force = bias.forces_at(&[Value::Scalar(x)])[0].components()[0];
        assert_approx_eq!(f64, force, numeric, epsilon = 1e-6);
    }
}

#[test]
fn well_tempered_scaling_damps_the_deposit() {
    let params = MetaParams {
        well_tempered: true,
        bias_temperature: Some(1.0),
        ..analytic_params()
    };
    let mut bias = MetaBias::new("mtd", colvars_one(), params, Box::new(UnitProxy)).unwrap();
    bias.update(&[Value::Scalar(0.0)]).unwrap();
    bias.update(&[Value::Scalar(0.2)]).unwrap();

    let weights: Vec<f64> = bias.store().hills().iter().map(|h| h.weight()).collect();
    assert_eq!(weights.len(), 2);
    assert_approx_eq!(f64, weights[0], 1.0, epsilon = 1e-12);
    // the second deposit sees E = exp(-1/2) at its position and kT_bias = 1
    assert_approx_eq!(f64, weights[1], (-(-0.5_f64).exp()).exp(), epsilon = 1e-12);
}

#[test]
fn mono_reflection_deposits_the_mirror_hill() {
    let params = MetaParams {
        gaussian_sigmas: Some(vec![0.1]),
        use_hills_reflection: true,
        reflection_up_limit_cvs: vec![0],
        reflection_up_limit: vec![1.0],
        ..analytic_params()
    };
    let colvars = vec![Colvar::scalar("d", 0.1, 0.0, 2.0).unwrap()];
    let mut bias = MetaBias::new("mtd", colvars, params, Box::new(StdProxy::default())).unwrap();
    bias.update(&[Value::Scalar(0.95)]).unwrap();

    let centers: Vec<f64> = bias
        .store()
        .hills()
        .iter()
        .map(|h| h.centers()[0].components()[0])
        .collect();
    assert_eq!(centers.len(), 2);
    assert_approx_eq!(f64, centers[0], 0.95, epsilon = 1e-12);
    assert_approx_eq!(f64, centers[1], 1.05, epsilon = 1e-12);
    for hill in bias.store().hills().iter() {
        assert_eq!(hill.sigmas(), &[0.1]);
    }

    // beyond the limit nothing is deposited at all
    bias.update(&[Value::Scalar(1.2)]).unwrap();
    assert_eq!(bias.store().hills().len(), 2);
}

#[test]
fn grid_expansion_preserves_accumulated_energy() {
    let mut cv = Colvar::scalar("x", 0.1, 0.0, 1.0).unwrap();
    cv.set_expand_boundaries(true);
    let params = MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        hill_width: Some(1.0),
        ..MetaParams::default()
    };
    let mut bias = MetaBias::new("mtd", vec![cv], params, Box::new(StdProxy::default())).unwrap();

    bias.update(&[Value::Scalar(0.5)]).unwrap();
    let axis_before = bias.store().energy_grid().unwrap().grid().axes()[0].clone();
    assert_approx_eq!(f64, axis_before.upper(), 1.1, epsilon = 1e-12);
    let before = bias.energy_at(&[Value::Scalar(0.5)]);
    assert!(before > 0.0);

    // drifting past the boundary grows the grid by the missing buffer
    bias.update(&[Value::Scalar(1.2)]).unwrap();
    let axis = bias.store().energy_grid().unwrap().grid().axes()[0].clone();
    assert_approx_eq!(f64, axis.lower(), -0.1, epsilon = 1e-12);
    assert_approx_eq!(f64, axis.upper(), 1.2 + 4.0 * 0.1, epsilon = 1e-12);

    // the hill at 1.2 is ten sigmas away, the old accumulation is intact
    let after = bias.energy_at(&[Value::Scalar(0.5)]);
    assert_approx_eq!(f64, after, before, epsilon = 1e-12);
}

#[test]
fn projection_agrees_with_the_analytic_sum() {
    let params = MetaParams {
        hill_weight: 0.7,
        new_hill_frequency: 1,
        grids_update_frequency: Some(5),
        gaussian_sigmas: Some(vec![0.25]),
        keep_hills: true,
        ..MetaParams::default()
    };
    let colvars = colvars_one();
    let mut bias = MetaBias::new(
        "mtd",
        colvars.clone(),
        params,
        Box::new(StdProxy::default()),
    )
    .unwrap();

    let mut rng = Pcg64::seed_from_u64(42);
    for _ in 0..5 {
        let x = rng.gen_range(-1.0..1.0);
        bias.update(&[Value::Scalar(x)]).unwrap();
    }
    assert_eq!(bias.store().hills().len(), 5);

    let energy_grid = bias.store().energy_grid().unwrap();
    let gradient_grid = bias.store().gradient_grid().unwrap();
    let grid = energy_grid.grid();
    let mut ix = grid.first_index();
    while grid.index_ok(&ix) {
        #[allow(clippy::cast_sign_loss)]
        let center = grid.bin_to_value(ix[0] as usize, 0);
        let x = [Value::Scalar(center)];
        let analytic = calc_hills(&colvars, bias.store().hills().iter(), &x);
        assert_approx_eq!(f64, energy_grid.value(&ix), analytic, epsilon = 1e-12);

        let mut forces = [Value::Scalar(0.0)];
        calc_hills_force(&colvars, bias.store().hills().iter(), &x, &mut forces);
        assert_approx_eq!(
            f64,
            gradient_grid.vector_value(&ix)[0],
            -forces[0].components()[0],
            epsilon = 1e-12
        );
        grid.incr(&mut ix);
    }
}

#[test]
fn text_state_round_trip_preserves_the_bias() {
    let params = MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        gaussian_sigmas: Some(vec![0.2]),
        keep_hills: true,
        ..MetaParams::default()
    };
    let colvars = colvars_one();
    let mut bias = MetaBias::new(
        "mtd",
        colvars.clone(),
        params.clone(),
        Box::new(StdProxy::default()),
    )
    .unwrap();
    for x in [0.1, 0.3, 0.5] {
        bias.update(&[Value::Scalar(x)]).unwrap();
    }

    let mut text = Vec::new();
    bias.write_state(&mut text).unwrap();
    let mut fresh =
        MetaBias::new("mtd", colvars, params, Box::new(StdProxy::default())).unwrap();
    fresh
        .read_state(std::str::from_utf8(&text).unwrap())
        .unwrap();

    assert_eq!(fresh.store().hills().len(), 3);
    for x in [-0.5, 0.0, 0.25, 0.7] {
        let point = [Value::Scalar(x)];
        assert_approx_eq!(
            f64,
            fresh.energy_at(&point),
            bias.energy_at(&point),
            epsilon = 1e-9
        );
        assert_approx_eq!(
            f64,
            fresh.forces_at(&point)[0].components()[0],
            bias.forces_at(&point)[0].components()[0],
            epsilon = 1e-9
        );
    }
}

#[test]
fn binary_snapshot_round_trip_is_bit_exact() {
    let params = MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        gaussian_sigmas: Some(vec![0.2]),
        keep_hills: true,
        ..MetaParams::default()
    };
    let colvars = colvars_one();
    let mut bias = MetaBias::new(
        "mtd",
        colvars.clone(),
        params.clone(),
        Box::new(StdProxy::default()),
    )
    .unwrap();
    for x in [0.1, -0.2, 0.55] {
        bias.update(&[Value::Scalar(x)]).unwrap();
    }

    let bytes = bias.snapshot().unwrap();
    let mut fresh =
        MetaBias::new("mtd", colvars, params, Box::new(StdProxy::default())).unwrap();
    fresh.restore_snapshot(&bytes).unwrap();

    for x in [-0.9, -0.2, 0.0, 0.1, 0.55, 1.3] {
        let point = [Value::Scalar(x)];
        assert_eq!(
            fresh.energy_at(&point).to_bits(),
            bias.energy_at(&point).to_bits()
        );
    }
}

#[test]
fn ebmeta_scales_deposits_by_the_inverse_target() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.dat");
    let mut file = std::fs::File::create(&target_path).unwrap();
    // a two-level distribution: twice the density below x = 0.5
    for bin in 0..10 {
        let center = f64::from(bin).mul_add(0.1, 0.05);
        let value = if center < 0.5 { 2.0 } else { 1.0 };
        writeln!(file, "{center:.9e} {value:.9e}").unwrap();
    }
    drop(file);

    let params = MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        gaussian_sigmas: Some(vec![0.05]),
        eb_meta: true,
        target_dist_file: Some(target_path),
        target_dist_min_val: 0.01,
        ..MetaParams::default()
    };
    let colvars = vec![Colvar::scalar("x", 0.1, 0.0, 1.0).unwrap()];
    let mut bias = MetaBias::new("mtd", colvars, params, Box::new(StdProxy::default())).unwrap();
    bias.update(&[Value::Scalar(0.25)]).unwrap();

    // normalized and volume-scaled, the lower half has density 2^(1/3)
    let expected = 2.0_f64.powf(-1.0 / 3.0);
    let weight = bias.store().hills().last().unwrap().weight();
    assert_approx_eq!(f64, weight, expected, epsilon = 1e-9);
}

#[test]
fn interval_clipping_zeroes_forces_outside_the_limits() {
    let params = MetaParams {
        gaussian_sigmas: Some(vec![0.1]),
        use_hills_reflection: true,
        reflection_up_limit_cvs: vec![0],
        reflection_up_limit: vec![1.0],
        ..analytic_params()
    };
    let colvars = vec![Colvar::scalar("d", 0.1, 0.0, 2.0).unwrap()];
    let mut bias = MetaBias::new("mtd", colvars, params, Box::new(StdProxy::default())).unwrap();
    bias.update(&[Value::Scalar(0.9)]).unwrap();

    // the interval limits were inherited from the reflection limits
    let outside = [Value::Scalar(1.05)];
    assert!(bias.energy_at(&outside) > 0.0);
    assert_eq!(bias.forces_at(&outside)[0], Value::Scalar(0.0));

    let inside = [Value::Scalar(0.8)];
    assert!(bias.forces_at(&inside)[0].components()[0].abs() > 0.0);
}

#[test]
fn output_files_are_written_under_the_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("out").display().to_string();
    let params = MetaParams {
        hill_weight: 1.0,
        new_hill_frequency: 1,
        gaussian_sigmas: Some(vec![0.2]),
        keep_free_energy_files: true,
        write_hills_trajectory: true,
        output_prefix: prefix.clone(),
        ..MetaParams::default()
    };
    let mut bias = MetaBias::new(
        "mtd",
        colvars_one(),
        params,
        Box::new(StdProxy::default()),
    )
    .unwrap();
    bias.update(&[Value::Scalar(0.0)]).unwrap();
    bias.write_outputs().unwrap();

    let pmf = std::fs::read_to_string(format!("{prefix}.mtd.pmf")).unwrap();
    assert!(pmf.starts_with("# 1"));
    let values: Vec<f64> = pmf
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .map(|line| line.split_whitespace().last().unwrap().parse().unwrap())
        .collect();
    assert_eq!(values.len(), 40);
    // shifted to a zero minimum at the deposition point and negated
    let minimum = values.iter().copied().fold(f64::INFINITY, f64::min);
    assert_approx_eq!(f64, minimum, 0.0, epsilon = 1e-12);
    assert!(values.iter().all(|&v| v >= 0.0));

    assert!(std::fs::metadata(format!("{prefix}.mtd.1.pmf")).is_ok());
    assert!(std::fs::metadata(format!("{prefix}.colvars.mtd.state")).is_ok());

    let traj = std::fs::read_to_string(format!("{prefix}.colvars.mtd.hills.traj")).unwrap();
    let first = traj.lines().next().unwrap();
    // step, center, 2σ, weight
    assert!(first.starts_with("1 "));
    assert_eq!(first.split_whitespace().count(), 4);
}
