//! End-to-end optimization scenarios: linear priors, rotation averaging,
//! a small inverse-depth bundle adjustment, degenerate problems, early
//! exit, and covariance extraction.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Vector3, dvector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use summit_solver::manifold::{LieGroup, Manifold, Rn, SE3, SO3};
use summit_solver::{
    Factor, Key, ManifoldValue, OptimizationStatus, Optimizer, OptimizerParams, Values,
};

const EPSILON: f64 = 1e-9;
const FD_STEP: f64 = 1e-7;

/// Central-difference Jacobian of a residual function over typed inputs,
/// one column per tangent dimension in input order.
fn numeric_jacobian(
    residual_fn: &dyn Fn(&[ManifoldValue]) -> DVector<f64>,
    inputs: &[ManifoldValue],
) -> DMatrix<f64> {
    let rows = residual_fn(inputs).nrows();
    let cols: usize = inputs.iter().map(ManifoldValue::tangent_dim).sum();
    let mut jacobian = DMatrix::zeros(rows, cols);
    let mut col = 0;
    for (input_idx, input) in inputs.iter().enumerate() {
        for j in 0..input.tangent_dim() {
            let mut delta = vec![0.0; input.tangent_dim()];

            delta[j] = FD_STEP;
            let mut plus = inputs.to_vec();
            plus[input_idx] = input.retract(&delta, EPSILON).unwrap();
            let residual_plus = residual_fn(&plus);

            delta[j] = -FD_STEP;
            let mut minus = inputs.to_vec();
            minus[input_idx] = input.retract(&delta, EPSILON).unwrap();
            let residual_minus = residual_fn(&minus);

            for r in 0..rows {
                jacobian[(r, col)] = (residual_plus[r] - residual_minus[r]) / (2.0 * FD_STEP);
            }
            col += 1;
        }
    }
    jacobian
}

/// Scenario 1: a single weighted linear prior `r(x) = w (x - mu) / sigma`.
#[test]
fn test_single_linear_prior() {
    let mu = 3.0;
    let weight = 2.0;
    let sigma = 0.5;

    let x0 = Key::new('x', 0);
    let mut values = Values::new();
    values.set(x0, Rn::from_slice(&[0.0]));

    let factors = vec![Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual = dvector![weight * (params[0][0] - mu) / sigma];
            let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, weight / sigma));
            Ok((residual, jacobian))
        },
        vec![x0],
    )];

    let params = OptimizerParams {
        initial_lambda: 1e-9,
        use_diagonal_damping: false,
        use_unit_damping: true,
        ..Default::default()
    };
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();

    assert!(converged);
    let stats = optimizer.stats();
    assert!(
        stats.iterations.len() <= 2,
        "expected 1-2 iterations, took {}",
        stats.iterations.len()
    );
    assert!(stats.final_error < 1e-18, "final error {}", stats.final_error);
    let x: &Rn = values.get(x0).unwrap();
    assert!((x.data()[0] - mu).abs() < 1e-9);
}

fn so3_prior_factor(key: Key, prior: SO3) -> Factor {
    Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual_fn = {
                let prior = prior.clone();
                move |inputs: &[ManifoldValue]| {
                    let ManifoldValue::SO3(rot) = &inputs[0] else {
                        unreachable!()
                    };
                    prior.local_coordinates(rot, EPSILON)
                }
            };
            let rot = SO3::from_storage(params[0].as_slice())?;
            let inputs = [ManifoldValue::SO3(rot)];
            let residual = residual_fn(&inputs);
            let jacobian = compute_jacobian.then(|| numeric_jacobian(&residual_fn, &inputs));
            Ok((residual, jacobian))
        },
        vec![key],
    )
}

fn so3_between_factor(key_a: Key, key_b: Key, target: SO3) -> Factor {
    Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual_fn = {
                let target = target.clone();
                move |inputs: &[ManifoldValue]| {
                    let (ManifoldValue::SO3(a), ManifoldValue::SO3(b)) =
                        (&inputs[0], &inputs[1])
                    else {
                        unreachable!()
                    };
                    target.local_coordinates(&a.between(b), EPSILON)
                }
            };
            let inputs = [
                ManifoldValue::SO3(SO3::from_storage(params[0].as_slice())?),
                ManifoldValue::SO3(SO3::from_storage(params[1].as_slice())?),
            ];
            let residual = residual_fn(&inputs);
            let jacobian = compute_jacobian.then(|| numeric_jacobian(&residual_fn, &inputs));
            Ok((residual, jacobian))
        },
        vec![key_a, key_b],
    )
}

/// Scenario 2: two rotations with identity priors and an identity between
/// factor, initialized at a random rotation.
#[test]
fn test_rotation_averaging() {
    let r0 = Key::new('R', 0);
    let r1 = Key::new('R', 1);

    let mut values = Values::new();
    let start = SO3::random();
    values.set(r0, start.clone());
    values.set(r1, start);

    let factors = vec![
        so3_prior_factor(r0, SO3::identity()),
        so3_prior_factor(r1, SO3::identity()),
        so3_between_factor(r0, r1, SO3::identity()),
    ];

    let params = OptimizerParams {
        iterations: 100,
        ..Default::default()
    };
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();

    assert!(converged, "stats: {}", optimizer.stats());
    assert!(
        optimizer.stats().final_error < 1e-12,
        "final error {}",
        optimizer.stats().final_error
    );

    let rot0: &SO3 = values.get(r0).unwrap();
    let rot1: &SO3 = values.get(r1).unwrap();
    let residual = rot0.local_coordinates(rot1, EPSILON);
    assert!(residual.norm() < 1e-6, "rotations disagree by {}", residual.norm());
    assert!(rot0.to_axis_angle(EPSILON).norm() < 1e-6);
}

fn reprojection_factor(
    camera_key: Key,
    landmark_key: Key,
    bearing: Vector3<f64>,
    observation: [f64; 2],
) -> Factor {
    Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual_fn = move |inputs: &[ManifoldValue]| {
                let (ManifoldValue::SE3(pose), ManifoldValue::Rn(inverse_depth)) =
                    (&inputs[0], &inputs[1])
                else {
                    unreachable!()
                };
                let point_world = bearing / inverse_depth.data()[0];
                let point_camera = pose.inverse().act(&point_world);
                dvector![
                    point_camera.x / point_camera.z - observation[0],
                    point_camera.y / point_camera.z - observation[1]
                ]
            };
            let inputs = [
                ManifoldValue::SE3(SE3::from_storage(params[0].as_slice())?),
                ManifoldValue::Rn(Rn::from_slice(params[1].as_slice())),
            ];
            let residual = residual_fn(&inputs);
            let jacobian = compute_jacobian.then(|| numeric_jacobian(&residual_fn, &inputs));
            Ok((residual, jacobian))
        },
        vec![camera_key, landmark_key],
    )
}

fn se3_prior_factor(key: Key, prior: SE3, weight: f64) -> Factor {
    Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual_fn = {
                let prior = prior.clone();
                move |inputs: &[ManifoldValue]| {
                    let ManifoldValue::SE3(pose) = &inputs[0] else {
                        unreachable!()
                    };
                    weight * prior.local_coordinates(pose, EPSILON)
                }
            };
            let inputs = [ManifoldValue::SE3(SE3::from_storage(params[0].as_slice())?)];
            let residual = residual_fn(&inputs);
            let jacobian = compute_jacobian.then(|| numeric_jacobian(&residual_fn, &inputs));
            Ok((residual, jacobian))
        },
        vec![key],
    )
}

/// Scenario 3: bundle-adjustment toy with two cameras and three
/// inverse-depth landmarks.
#[test]
fn test_bundle_adjustment_toy() {
    summit_solver::init_iteration_logger();

    let noise_sigma = 1e-3;
    let mut rng = StdRng::seed_from_u64(7);
    let mut gaussian = move || {
        let u1: f64 = rng.random::<f64>().max(1e-12);
        let u2: f64 = rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    };

    // Ground truth: cameras as world-from-camera poses, landmarks as
    // inverse depths along fixed bearings out of the first camera
    let cam0_true = SE3::identity();
    let cam1_true = SE3::new(
        SO3::from_axis_angle(&Vector3::new(0.02, -0.03, 0.01), EPSILON),
        Vector3::new(0.4, 0.05, -0.05),
    );
    let bearings = [
        Vector3::new(0.10, 0.05, 1.0),
        Vector3::new(-0.15, 0.10, 1.0),
        Vector3::new(0.05, -0.10, 1.0),
    ];
    let inverse_depths_true = [0.5, 0.25, 0.4];

    let c0 = Key::new('c', 0);
    let c1 = Key::new('c', 1);
    let landmark_keys = [Key::new('l', 0), Key::new('l', 1), Key::new('l', 2)];

    let mut factors = Vec::new();
    for (landmark_idx, (&bearing, &rho)) in
        bearings.iter().zip(&inverse_depths_true).enumerate()
    {
        let point_world = bearing / rho;
        for (camera_key, camera_pose) in [(c0, &cam0_true), (c1, &cam1_true)] {
            let point_camera = camera_pose.inverse().act(&point_world);
            let observation = [
                point_camera.x / point_camera.z + noise_sigma * gaussian(),
                point_camera.y / point_camera.z + noise_sigma * gaussian(),
            ];
            factors.push(reprojection_factor(
                camera_key,
                landmark_keys[landmark_idx],
                bearing,
                observation,
            ));
        }
    }
    // Gauge fixing: pin the first camera and the scale
    factors.push(se3_prior_factor(c0, cam0_true.clone(), 1e3));
    factors.push(Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual = dvector![1e2 * (params[0][0] - 0.5)];
            let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, 1e2));
            Ok((residual, jacobian))
        },
        vec![landmark_keys[0]],
    ));

    // Initial guess: ground truth perturbed by roughly 10%
    let mut values = Values::new();
    values.set(c0, cam0_true.clone());
    values.set(
        c1,
        cam1_true
            .retract(&[0.04, -0.01, 0.01, 0.005, 0.004, -0.003], EPSILON)
            .unwrap(),
    );
    for (key, rho) in landmark_keys.iter().zip(&inverse_depths_true) {
        values.set(*key, Rn::from_slice(&[rho * 1.1]));
    }

    let params = OptimizerParams {
        iterations: 100,
        early_exit_min_reduction: 1e-3,
        ..Default::default()
    };
    let keys = vec![c0, c1, landmark_keys[0], landmark_keys[1], landmark_keys[2]];
    let mut optimizer =
        Optimizer::with_keys(params, factors, EPSILON, keys.clone(), "ba_toy".to_string())
            .unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();
    assert!(converged, "stats: {}", optimizer.stats());

    // Reprojection RMS at the solution should sit at the noise level
    let lin = optimizer.linearize(&values).unwrap();
    let reprojection_rows = 12;
    let mut sum_squares = 0.0;
    for i in 0..reprojection_rows {
        sum_squares += lin.residual[(i, 0)] * lin.residual[(i, 0)];
    }
    let rms = (sum_squares / reprojection_rows as f64).sqrt();
    assert!(rms < 3.0 * noise_sigma, "reprojection RMS {rms}");

    // Block-arrow sparsity: landmarks never couple to each other
    let landmark_range = 12..15;
    for triplet in lin.hessian_lower.triplet_iter() {
        if landmark_range.contains(&triplet.row)
            && landmark_range.contains(&triplet.col)
            && triplet.row != triplet.col
        {
            panic!(
                "unexpected landmark-landmark coupling at ({}, {})",
                triplet.row, triplet.col
            );
        }
    }

    // The camera prefix goes through the block-diagonal Schur path
    let mut covariances = HashMap::new();
    optimizer
        .compute_covariances(&lin, &[c0, c1], &mut covariances)
        .unwrap();
    assert_eq!(covariances.len(), 2);
    assert_eq!(covariances[&c1].nrows(), 6);
}

/// Scenario 4: one unconstrained key makes the undamped Hessian singular.
#[test]
fn test_non_pd_recovery() {
    let build = || {
        let constrained = Key::new('x', 0);
        let floating = Key::new('x', 1);
        let mut values = Values::new();
        values.set(constrained, Rn::from_slice(&[0.0]));
        values.set(floating, Rn::from_slice(&[1.0]));
        let factors = vec![Factor::jacobian(
            |params: &[DVector<f64>], compute_jacobian| {
                let residual = dvector![params[0][0] - 2.0];
                let jacobian = compute_jacobian.then(|| {
                    let mut jac = DMatrix::zeros(1, 2);
                    jac[(0, 0)] = 1.0;
                    jac
                });
                Ok((residual, jacobian))
            },
            vec![constrained, floating],
        )];
        (values, factors)
    };

    // Marquardt damping with a clamped diagonal keeps the system solvable
    let (mut values, factors) = build();
    let params = OptimizerParams::default();
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    optimizer.optimize(&mut values).unwrap();
    let stats = optimizer.stats();
    assert!(stats.final_error < stats.initial_error);

    // Zero damping cannot regularize the singular Hessian
    let (mut values, factors) = build();
    let params = OptimizerParams {
        initial_lambda: 0.0,
        use_diagonal_damping: false,
        use_unit_damping: true,
        ..Default::default()
    };
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();
    assert!(!converged);
    assert_eq!(
        optimizer.stats().status,
        OptimizationStatus::NumericalFailure
    );
}

/// Scenario 5: a large initial lambda makes the first accepted step tiny,
/// so the early-exit reduction threshold fires immediately.
#[test]
fn test_early_exit_on_small_reduction() {
    let x0 = Key::new('x', 0);
    let mut values = Values::new();
    values.set(x0, Rn::from_slice(&[0.0]));

    let factors = vec![Factor::jacobian(
        |params: &[DVector<f64>], compute_jacobian| {
            let residual = dvector![params[0][0] - 1.0];
            let jacobian = compute_jacobian.then(|| DMatrix::identity(1, 1));
            Ok((residual, jacobian))
        },
        vec![x0],
    )];

    let params = OptimizerParams {
        early_exit_min_reduction: 0.1,
        initial_lambda: 1e6,
        use_diagonal_damping: false,
        use_unit_damping: true,
        ..Default::default()
    };
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();

    assert!(converged);
    let stats = optimizer.stats();
    assert_eq!(stats.status, OptimizationStatus::Converged);
    assert_eq!(stats.iterations.len(), 1);
    assert_eq!(stats.num_accepted(), 1);
}

/// Scenario 6: the covariance of a single weighted prior is `(sigma/w)^2`.
#[test]
fn test_covariance_consistency() {
    let mu = 3.0;
    let weight = 2.0;
    let sigma = 0.5;

    let x0 = Key::new('x', 0);
    let mut values = Values::new();
    values.set(x0, Rn::from_slice(&[0.0]));

    let factors = vec![Factor::jacobian(
        move |params: &[DVector<f64>], compute_jacobian| {
            let residual = dvector![weight * (params[0][0] - mu) / sigma];
            let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, weight / sigma));
            Ok((residual, jacobian))
        },
        vec![x0],
    )];

    let mut optimizer = Optimizer::new(OptimizerParams::default(), factors, EPSILON).unwrap();
    let converged = optimizer.optimize(&mut values).unwrap();
    assert!(converged);

    let lin = optimizer.linearize(&values).unwrap();
    let mut covariances = HashMap::new();
    optimizer
        .compute_all_covariances(&lin, &mut covariances)
        .unwrap();

    let expected = (sigma / weight) * (sigma / weight);
    let actual = covariances[&x0][(0, 0)];
    assert!(
        (actual - expected).abs() < 1e-9,
        "covariance {actual}, expected {expected}"
    );
}

/// Derivative checking reports a deviation without failing the run.
#[test]
fn test_check_derivatives_reports_deviation() {
    let x0 = Key::new('x', 0);
    let mut values = Values::new();
    values.set(x0, Rn::from_slice(&[0.5]));

    let factors = vec![Factor::jacobian(
        |params: &[DVector<f64>], compute_jacobian| {
            let x = params[0][0];
            let residual = dvector![x * x - 2.0];
            let jacobian = compute_jacobian.then(|| DMatrix::from_element(1, 1, 2.0 * x));
            Ok((residual, jacobian))
        },
        vec![x0],
    )];

    let params = OptimizerParams {
        check_derivatives: true,
        ..Default::default()
    };
    let mut optimizer = Optimizer::new(params, factors, EPSILON).unwrap();
    optimizer.optimize(&mut values).unwrap();

    let deviation = optimizer
        .stats()
        .max_derivative_deviation
        .expect("derivative check ran");
    assert!(deviation < 1e-6, "deviation {deviation}");
}
