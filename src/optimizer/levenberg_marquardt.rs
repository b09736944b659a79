//! Levenberg-Marquardt trust-region driver.
//!
//! The driver owns the damping state machine:
//!
//! ```text
//! INIT -> ITERATING -> { CONVERGED, MAX_ITERATIONS, DIVERGED, NUMERICAL_FAILURE }
//! ```
//!
//! Each iteration solves the damped normal equations
//! `(H + λ·M) Δ = -g` with `M = clamp(diag(H))` (Marquardt's scaling) or
//! `M = I` (Levenberg's), retracts the step onto the manifold, and accepts
//! or rejects based on the achieved error. Lambda shrinks by the
//! down-factor on acceptance and grows by the up-factor on rejection or
//! factorization failure; the new linearization computed for step
//! evaluation is kept when the step is accepted, so each accepted
//! iteration costs exactly one relinearization.
//!
//! Numerical failures (non-PD factorization, non-finite residual) are
//! absorbed as rejected steps while the retry budget lasts; once λ can no
//! longer grow or the rejection streak exhausts the budget, the driver
//! exits with `NUMERICAL_FAILURE` or `DIVERGED` and the values are
//! restored to the last accepted point.

use std::time::Instant;

use faer::sparse::{SparseColMat, Triplet};
use tracing::info;

use crate::core::factor::Factor;
use crate::core::values::{Values, ValuesIndex};
use crate::linalg::{LinAlgError, SparseLdltSolver, SparseLinearSolver};
use crate::optimizer::linearizer::{Linearization, Linearizer};
use crate::optimizer::{
    IterationStats, OptimizationStats, OptimizationStatus, OptimizerParams, OptimizerResult,
};

/// The damped trust-region loop over a linearizer.
pub struct LevenbergMarquardtSolver {
    params: OptimizerParams,
    epsilon: f64,
    linear_solver: SparseLdltSolver,
}

impl LevenbergMarquardtSolver {
    pub fn new(params: OptimizerParams, epsilon: f64) -> Self {
        LevenbergMarquardtSolver {
            params,
            epsilon,
            linear_solver: SparseLdltSolver::new(),
        }
    }

    /// Replace the params; takes effect on the next `solve` call.
    pub fn update_params(&mut self, params: OptimizerParams) {
        self.params = params;
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    /// Run up to `num_iterations` damped iterations, refining `values` in
    /// place. Returns the exit status and the linearization at the
    /// best-seen values.
    pub fn solve(
        &mut self,
        factors: &[Factor],
        linearizer: &mut Linearizer,
        index: &ValuesIndex,
        values: &mut Values,
        num_iterations: usize,
        stats: &mut OptimizationStats,
    ) -> OptimizerResult<(OptimizationStatus, Linearization)> {
        let mut lin = linearizer.relinearize(factors, values, false)?;
        let mut current_error = lin.error();
        stats.initial_error = current_error;

        let mut best_values = values.clone();
        let mut lambda = self.params.initial_lambda;
        let mut consecutive_rejections = 0usize;

        IterationStats::log_header();

        let mut status = OptimizationStatus::MaxIterationsReached;
        for iteration in 0..num_iterations {
            let damping = self.damping_coefficients(&lin);
            let damped_hessian = self.damped_hessian(&lin, lambda, &damping)?;

            let solve_start = Instant::now();
            let step = match self.linear_solver.factorize(&damped_hessian) {
                Ok(()) => self.linear_solver.solve(&(-&lin.gradient)),
                Err(e) => Err(e),
            };
            let solve_time_ms = solve_start.elapsed().as_secs_f64() * 1000.0;

            let step = match step {
                Ok(step) if step_is_finite(&step) => step,
                _ => {
                    // Factorization failed even with damping: raise lambda
                    // and retry, burning one iteration from the budget
                    stats.iterations.push(IterationStats {
                        iteration,
                        error: current_error,
                        lambda,
                        step_norm: 0.0,
                        gradient_norm: lin.gradient_max_norm(),
                        solve_time_ms,
                        accepted: false,
                    });
                    if let Some(record) = stats.iterations.last() {
                        record.log_line();
                    }
                    consecutive_rejections += 1;
                    if lambda >= self.params.lambda_max
                        || consecutive_rejections >= self.params.max_consecutive_rejections
                    {
                        status = OptimizationStatus::NumericalFailure;
                        break;
                    }
                    lambda = next_lambda_up(lambda, &self.params);
                    continue;
                }
            };

            let step_norm = step.norm_l2();
            let step_data: Vec<f64> = (0..step.nrows()).map(|i| step[(i, 0)]).collect();
            values.retract(index, &step_data, self.epsilon)?;

            let new_lin = linearizer.relinearize(factors, values, false)?;
            let new_error = new_lin.error();

            if !new_error.is_finite() {
                values.update(index, index, &best_values)?;
                stats.iterations.push(IterationStats {
                    iteration,
                    error: current_error,
                    lambda,
                    step_norm,
                    gradient_norm: lin.gradient_max_norm(),
                    solve_time_ms,
                    accepted: false,
                });
                if let Some(record) = stats.iterations.last() {
                    record.log_line();
                }
                status = OptimizationStatus::NumericalFailure;
                break;
            }

            let predicted_reduction = predicted_reduction(&step_data, &damping, lambda, &lin);
            let actual_reduction = current_error - new_error;
            let gain_ratio = if predicted_reduction.abs() < f64::EPSILON {
                if actual_reduction > 0.0 { 1.0 } else { 0.0 }
            } else {
                actual_reduction / predicted_reduction
            };
            let accepted = if self.params.min_gain_ratio > 0.0 {
                actual_reduction > 0.0 && gain_ratio > self.params.min_gain_ratio
            } else {
                actual_reduction > 0.0
            };

            stats.iterations.push(IterationStats {
                iteration,
                error: if accepted { new_error } else { current_error },
                lambda,
                step_norm,
                gradient_norm: lin.gradient_max_norm(),
                solve_time_ms,
                accepted,
            });
            if let Some(record) = stats.iterations.last() {
                record.log_line();
            }

            if accepted {
                let relative_reduction = actual_reduction / current_error.max(self.epsilon);
                current_error = new_error;
                lin = new_lin;
                best_values.update(index, index, values)?;
                consecutive_rejections = 0;
                lambda = if self.params.enable_bold_updates {
                    self.params.lambda_min
                } else {
                    (lambda * self.params.lambda_down_factor).max(self.params.lambda_min)
                };

                if relative_reduction < self.params.early_exit_min_reduction
                    || step_norm < self.params.step_tolerance
                    || lin.gradient_max_norm() < self.params.gradient_tolerance
                {
                    status = OptimizationStatus::Converged;
                    break;
                }
            } else {
                values.update(index, index, &best_values)?;
                consecutive_rejections += 1;
                lambda = next_lambda_up(lambda, &self.params);
                if lambda >= self.params.lambda_max
                    && consecutive_rejections >= self.params.max_consecutive_rejections
                {
                    status = OptimizationStatus::Diverged;
                    break;
                }
            }
        }

        // Leave the values at the best accepted point no matter how the
        // loop exited
        values.update(index, index, &best_values)?;
        stats.status = status;
        stats.final_error = current_error;
        if self.params.verbose {
            info!(
                "{} after {} iteration(s), error {:.6e} -> {:.6e}",
                status,
                stats.iterations.len(),
                stats.initial_error,
                stats.final_error
            );
        }
        Ok((status, lin))
    }

    /// Per-column damping weights: clamped Hessian diagonal for Marquardt
    /// scaling, all ones for Levenberg.
    fn damping_coefficients(&self, lin: &Linearization) -> Vec<f64> {
        if self.params.use_diagonal_damping {
            lin.hessian_diagonal()
                .into_iter()
                .map(|d| d.max(self.params.diagonal_damping_min))
                .collect()
        } else {
            vec![1.0; lin.tangent_dim()]
        }
    }

    /// `H + lambda * M` with `M` the diagonal damping matrix.
    fn damped_hessian(
        &self,
        lin: &Linearization,
        lambda: f64,
        damping: &[f64],
    ) -> OptimizerResult<SparseColMat<usize, f64>> {
        let n = damping.len();
        let triplets: Vec<Triplet<usize, usize, f64>> = damping
            .iter()
            .enumerate()
            .map(|(i, m)| Triplet::new(i, i, lambda * m))
            .collect();
        let damping_matrix =
            SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
                LinAlgError::SparseMatrixCreation("failed to create damping matrix".to_string())
                    .log_with_source(e)
            })?;
        Ok(&lin.hessian_lower + damping_matrix)
    }
}

fn next_lambda_up(lambda: f64, params: &OptimizerParams) -> f64 {
    (lambda * params.lambda_up_factor).min(params.lambda_max)
}

fn step_is_finite(step: &faer::Mat<f64>) -> bool {
    (0..step.nrows()).all(|i| step[(i, 0)].is_finite())
}

/// Model-predicted error reduction `0.5 * Δ^T (λ·M·Δ - g)` for the damped
/// system `(H + λ·M) Δ = -g`.
fn predicted_reduction(
    step: &[f64],
    damping: &[f64],
    lambda: f64,
    lin: &Linearization,
) -> f64 {
    let mut value = 0.0;
    for (i, &s) in step.iter().enumerate() {
        value += s * (lambda * damping[i] * s - lin.gradient[(i, 0)]);
    }
    0.5 * value
}
