//! Nonlinear least-squares optimization.
//!
//! The [`Optimizer`] façade owns the factor list and the optimized-key
//! index, wires the [`Linearizer`] to the
//! [`LevenbergMarquardtSolver`](levenberg_marquardt::LevenbergMarquardtSolver)
//! driver, and exposes covariance extraction. Create one per problem and
//! call [`Optimizer::optimize`] as many times as needed with different
//! initial guesses; the factor structure and the sparsity pattern are set
//! up once, on the first call, because the index depends on the dimensions
//! observed in the actual values.
//!
//! One instance per worker: the optimizer is stateful (cached sparsity,
//! damping state, scratch buffers) and is not meant to be shared across
//! concurrent callers.

use std::collections::HashMap;
use std::fmt;

use nalgebra::DMatrix;
use thiserror::Error;
use tracing::{debug, error};

use crate::core::factor::Factor;
use crate::core::key::Key;
use crate::core::values::{Values, ValuesIndex};
use crate::core::CoreError;
use crate::linalg::LinAlgError;

mod covariance;
mod derivative_check;
pub mod levenberg_marquardt;
pub mod linearizer;

pub use levenberg_marquardt::LevenbergMarquardtSolver;
pub use linearizer::{Linearization, Linearizer};

/// Optimizer-level error types.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Params out of range or inconsistent problem setup
    #[error("Invalid optimizer parameters: {0}")]
    InvalidParameters(String),

    /// Factor output shapes changed or disagree with the declared keys
    #[error("Structural error: {0}")]
    Structural(String),

    /// A factor wants to optimize a key outside the optimized set
    #[error("Factor references key {0} missing from the optimized set")]
    UnknownFactorKey(Key),

    /// The linearizer was used before `initialize`
    #[error("Linearizer used before initialization")]
    NotInitialized,

    /// Numerical breakdown outside the LM retry loop
    #[error("Numerical failure: {0}")]
    Numerical(String),

    /// Problem-definition error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Linear-algebra backend error
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),
}

impl OptimizerError {
    /// Log the error at error level and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for optimizer operations.
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Exit status of an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationStatus {
    /// No optimization has run yet
    #[default]
    Init,
    /// Converged: early exit, step tolerance, or gradient tolerance
    Converged,
    /// Iteration budget exhausted without meeting tolerances
    MaxIterationsReached,
    /// Damping saturated through a rejection streak
    Diverged,
    /// Factorization failed at maximum damping or the residual became
    /// non-finite
    NumericalFailure,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Init => write!(f, "Not started"),
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Diverged => write!(f, "Diverged"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
        }
    }
}

/// Configuration of the Levenberg-Marquardt driver.
///
/// A flat record of every damping and termination knob; hot-swappable
/// between `optimize` calls through [`Optimizer::update_params`].
#[derive(Debug, Clone)]
pub struct OptimizerParams {
    /// Maximum outer iterations per `optimize` call
    pub iterations: usize,
    /// Relative error reduction below which an accepted step exits early
    pub early_exit_min_reduction: f64,
    /// Initial damping parameter
    pub initial_lambda: f64,
    /// Multiplier applied to lambda on rejection
    pub lambda_up_factor: f64,
    /// Multiplier applied to lambda on acceptance
    pub lambda_down_factor: f64,
    /// Lower clamp for lambda
    pub lambda_min: f64,
    /// Upper clamp for lambda
    pub lambda_max: f64,
    /// Damp with `lambda * diag(H)` (Marquardt's scaling)
    pub use_diagonal_damping: bool,
    /// Damp with `lambda * I` (Levenberg's)
    pub use_unit_damping: bool,
    /// Lower clamp on the Hessian diagonal used for Marquardt damping, so
    /// unconstrained directions still receive damping
    pub diagonal_damping_min: f64,
    /// Gain-ratio acceptance threshold; at zero, plain error decrease
    pub min_gain_ratio: f64,
    /// Step-norm convergence threshold
    pub step_tolerance: f64,
    /// Gradient infinity-norm convergence threshold
    pub gradient_tolerance: f64,
    /// Rejection-streak budget before declaring divergence or numerical
    /// failure
    pub max_consecutive_rejections: usize,
    /// Reset lambda to `lambda_min` after each accepted step
    pub enable_bold_updates: bool,
    /// Cross-check analytic Jacobians against central differences at the
    /// first linearization
    pub check_derivatives: bool,
    /// Log a summary at info level after each solve
    pub verbose: bool,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        OptimizerParams {
            iterations: 50,
            early_exit_min_reduction: 1e-6,
            initial_lambda: 1.0,
            lambda_up_factor: 4.0,
            lambda_down_factor: 0.25,
            lambda_min: 1e-12,
            lambda_max: 1e12,
            use_diagonal_damping: true,
            use_unit_damping: false,
            diagonal_damping_min: 1e-6,
            min_gain_ratio: 0.0,
            step_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            max_consecutive_rejections: 10,
            enable_bold_updates: false,
            check_derivatives: false,
            verbose: false,
        }
    }
}

impl OptimizerParams {
    /// Check the params for out-of-range or inconsistent settings.
    pub fn validate(&self) -> OptimizerResult<()> {
        if self.iterations == 0 {
            return Err(OptimizerError::InvalidParameters(
                "iterations must be positive".to_string(),
            ));
        }
        if !(self.initial_lambda.is_finite() && self.initial_lambda >= 0.0) {
            return Err(OptimizerError::InvalidParameters(
                "initial_lambda must be finite and non-negative".to_string(),
            ));
        }
        if self.lambda_up_factor <= 1.0 {
            return Err(OptimizerError::InvalidParameters(
                "lambda_up_factor must be greater than 1".to_string(),
            ));
        }
        if !(self.lambda_down_factor > 0.0 && self.lambda_down_factor < 1.0) {
            return Err(OptimizerError::InvalidParameters(
                "lambda_down_factor must lie in (0, 1)".to_string(),
            ));
        }
        if !(self.lambda_min >= 0.0 && self.lambda_min <= self.lambda_max) {
            return Err(OptimizerError::InvalidParameters(
                "lambda bounds must satisfy 0 <= lambda_min <= lambda_max".to_string(),
            ));
        }
        if self.use_diagonal_damping == self.use_unit_damping {
            return Err(OptimizerError::InvalidParameters(
                "exactly one of use_diagonal_damping / use_unit_damping must be set".to_string(),
            ));
        }
        if self.diagonal_damping_min <= 0.0 {
            return Err(OptimizerError::InvalidParameters(
                "diagonal_damping_min must be positive".to_string(),
            ));
        }
        if self.early_exit_min_reduction < 0.0
            || self.min_gain_ratio < 0.0
            || self.step_tolerance < 0.0
            || self.gradient_tolerance < 0.0
        {
            return Err(OptimizerError::InvalidParameters(
                "tolerances must be non-negative".to_string(),
            ));
        }
        if self.max_consecutive_rejections == 0 {
            return Err(OptimizerError::InvalidParameters(
                "max_consecutive_rejections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Record of a single damped iteration.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration index within this `optimize` call
    pub iteration: usize,
    /// Error `0.5 * ||R||^2` after this iteration
    pub error: f64,
    /// Damping parameter used for the solve
    pub lambda: f64,
    /// L2 norm of the step
    pub step_norm: f64,
    /// Infinity norm of the gradient at the linearization point
    pub gradient_norm: f64,
    /// Linear solve time in milliseconds
    pub solve_time_ms: f64,
    /// Whether the step was accepted
    pub accepted: bool,
}

impl IterationStats {
    /// Emit the table header at debug level.
    pub fn log_header() {
        debug!(
            "{:>4}  {:>13}  {:>11}  {:>11}  {:>11}  {:>10}  {:>6}",
            "iter", "error", "lambda", "|step|", "|grad|", "solve", "status"
        );
    }

    /// Emit one table line at debug level.
    pub fn log_line(&self) {
        debug!(
            "{:>4}  {:>13.6e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>8.2}ms  {:>6}",
            self.iteration,
            self.error,
            self.lambda,
            self.step_norm,
            self.gradient_norm,
            self.solve_time_ms,
            if self.accepted { "ok" } else { "rej" }
        );
    }
}

/// Statistics of one optimization run.
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    /// Per-iteration records, including rejected and failed attempts
    pub iterations: Vec<IterationStats>,
    /// Error at the initial values
    pub initial_error: f64,
    /// Error at the best accepted values
    pub final_error: f64,
    /// Exit status
    pub status: OptimizationStatus,
    /// Maximum analytic-vs-numerical Jacobian deviation, when
    /// `check_derivatives` ran
    pub max_derivative_deviation: Option<f64>,
}

impl OptimizationStats {
    /// Number of accepted steps.
    pub fn num_accepted(&self) -> usize {
        self.iterations.iter().filter(|r| r.accepted).count()
    }
}

impl fmt::Display for OptimizationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optimization result: {}", self.status)?;
        writeln!(f, "  Initial error: {:.6e}", self.initial_error)?;
        writeln!(f, "  Final error:   {:.6e}", self.final_error)?;
        writeln!(
            f,
            "  Iterations:    {} ({} accepted)",
            self.iterations.len(),
            self.num_accepted()
        )?;
        if let Some(deviation) = self.max_derivative_deviation {
            writeln!(f, "  Max Jacobian deviation: {:.3e}", deviation)?;
        }
        Ok(())
    }
}

/// Nonlinear least-squares optimizer over a list of factors.
///
/// ```
/// use nalgebra::{DMatrix, dvector};
/// use summit_solver::{Factor, Key, OptimizerParams, Optimizer, Values};
/// use summit_solver::manifold::Rn;
///
/// let x0 = Key::new('x', 0);
/// let mut values = Values::new();
/// values.set(x0, Rn::from_slice(&[0.0]));
///
/// let factors = vec![Factor::jacobian(
///     |params: &[nalgebra::DVector<f64>], compute_jacobian| {
///         let residual = dvector![params[0][0] - 1.0];
///         let jacobian = compute_jacobian.then(|| DMatrix::identity(1, 1));
///         Ok((residual, jacobian))
///     },
///     vec![x0],
/// )];
///
/// let mut optimizer = Optimizer::new(OptimizerParams::default(), factors, 1e-9).unwrap();
/// let converged = optimizer.optimize(&mut values).unwrap();
/// assert!(converged);
/// ```
pub struct Optimizer {
    factors: Vec<Factor>,
    name: String,
    epsilon: f64,
    keys: Vec<Key>,
    index: Option<ValuesIndex>,
    linearizer: Linearizer,
    solver: LevenbergMarquardtSolver,
    stats: OptimizationStats,
}

impl Optimizer {
    /// Create an optimizer over `factors`. The optimized keys default to
    /// the union of the factors' optimized keys in first-seen order.
    pub fn new(
        params: OptimizerParams,
        factors: Vec<Factor>,
        epsilon: f64,
    ) -> OptimizerResult<Self> {
        let keys = default_optimized_keys(&factors);
        Self::with_keys(params, factors, epsilon, keys, "summit::Optimize".to_string())
    }

    /// Create an optimizer with an explicit optimized-key order and name.
    pub fn with_keys(
        params: OptimizerParams,
        factors: Vec<Factor>,
        epsilon: f64,
        keys: Vec<Key>,
        name: String,
    ) -> OptimizerResult<Self> {
        params.validate()?;
        if factors.is_empty() {
            return Err(OptimizerError::InvalidParameters(
                "optimizer needs at least one factor".to_string(),
            ));
        }
        if keys.is_empty() {
            return Err(OptimizerError::InvalidParameters(
                "optimizer needs at least one optimized key".to_string(),
            ));
        }
        Ok(Optimizer {
            factors,
            name,
            epsilon,
            keys,
            index: None,
            linearizer: Linearizer::new(),
            solver: LevenbergMarquardtSolver::new(params, epsilon),
            stats: OptimizationStats::default(),
        })
    }

    /// The optimizer's name (used in logs).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The optimized keys, in index order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Stats of the most recent `optimize` call.
    pub fn stats(&self) -> &OptimizationStats {
        &self.stats
    }

    /// Current driver params.
    pub fn params(&self) -> &OptimizerParams {
        self.solver.params()
    }

    /// Replace the driver params; takes effect on the next iteration.
    pub fn update_params(&mut self, params: OptimizerParams) -> OptimizerResult<()> {
        params.validate()?;
        self.solver.update_params(params);
        Ok(())
    }

    /// Whether lazy initialization has run.
    pub fn is_initialized(&self) -> bool {
        self.linearizer.is_initialized()
    }

    /// Optimize `values` in place with the configured iteration budget.
    /// Returns true iff the run exited in the `Converged` state; the
    /// best-seen values are written back regardless.
    pub fn optimize(&mut self, values: &mut Values) -> OptimizerResult<bool> {
        self.optimize_with(values, None, None)
    }

    /// Optimize with an optional iteration-budget override and an optional
    /// slot receiving the linearization at the best values.
    pub fn optimize_with(
        &mut self,
        values: &mut Values,
        num_iterations: Option<usize>,
        best_linearization: Option<&mut Option<Linearization>>,
    ) -> OptimizerResult<bool> {
        self.initialize(values)?;
        let num_iterations = num_iterations.unwrap_or(self.solver.params().iterations);

        let max_derivative_deviation = self.stats.max_derivative_deviation;
        self.stats = OptimizationStats {
            max_derivative_deviation,
            ..OptimizationStats::default()
        };

        let index = self.index.as_ref().expect("initialized above");
        let (status, lin) = self.solver.solve(
            &self.factors,
            &mut self.linearizer,
            index,
            values,
            num_iterations,
            &mut self.stats,
        )?;
        if let Some(slot) = best_linearization {
            *slot = Some(lin);
        }
        Ok(status == OptimizationStatus::Converged)
    }

    /// Linearize the problem at `values` without iterating. Materializes
    /// the sparse Jacobian when every factor is Jacobian-form.
    pub fn linearize(&mut self, values: &Values) -> OptimizerResult<Linearization> {
        self.initialize(values)?;
        let include_jacobian = self.factors.iter().all(Factor::supports_jacobian);
        self.linearizer
            .relinearize(&self.factors, values, include_jacobian)
    }

    /// Marginal covariances of every optimized key at `linearization`.
    ///
    /// Inverts the full epsilon-regularized Hessian and extracts per-key
    /// diagonal blocks. Entries in `covariances_by_key` are reused; keys
    /// not optimized by this optimizer are removed.
    pub fn compute_all_covariances(
        &mut self,
        linearization: &Linearization,
        covariances_by_key: &mut HashMap<Key, DMatrix<f64>>,
    ) -> OptimizerResult<()> {
        let index = self.index.as_ref().ok_or(OptimizerError::NotInitialized)?;
        let hessian = covariance::dense_hessian(linearization, self.epsilon);
        let full = covariance::invert_spd(&hessian)?;
        covariance::extract_key_covariances(&full, index.entries(), covariances_by_key);
        Ok(())
    }

    /// Marginal covariances for `keys`, which must be a prefix of the
    /// optimized key order.
    ///
    /// Marginalizes the complement through the Schur complement
    /// `S = B - E C^{-1} E^T`, with a per-block inverse of `C` when the
    /// complement keys are mutually uncoupled and a dense solve otherwise.
    pub fn compute_covariances(
        &mut self,
        linearization: &Linearization,
        keys: &[Key],
        covariances_by_key: &mut HashMap<Key, DMatrix<f64>>,
    ) -> OptimizerResult<()> {
        let index = self.index.as_ref().ok_or(OptimizerError::NotInitialized)?;
        if keys.len() > self.keys.len() || keys.iter().zip(&self.keys).any(|(a, b)| a != b) {
            return Err(OptimizerError::InvalidParameters(
                "keys must be a prefix of the optimizer's key order".to_string(),
            )
            .log());
        }

        let entries = index.entries();
        let split = if keys.len() == entries.len() {
            index.tangent_dim()
        } else {
            entries[keys.len()].tangent_offset
        };
        let complement_blocks: Vec<(usize, usize)> = entries[keys.len()..]
            .iter()
            .map(|entry| (entry.tangent_offset, entry.tangent_dim))
            .collect();

        let block_diagonal = covariance::complement_is_block_diagonal(
            linearization,
            split,
            &complement_blocks,
        );
        let hessian = covariance::dense_hessian(linearization, self.epsilon);
        let marginal =
            covariance::schur_covariance(&hessian, split, &complement_blocks, block_diagonal)?;
        covariance::extract_key_covariances(
            &marginal,
            &entries[..keys.len()],
            covariances_by_key,
        );
        Ok(())
    }

    /// Lazy setup: build the index from the optimized keys as dimensioned
    /// by `values`, initialize the linearizer, and run the derivative
    /// check when enabled.
    fn initialize(&mut self, values: &Values) -> OptimizerResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let index = values.create_index(&self.keys)?;
        self.linearizer.initialize(&self.factors, values, &index)?;
        if self.solver.params().check_derivatives {
            let deviation = derivative_check::check_factor_derivatives(
                &self.factors,
                values,
                &index,
                self.epsilon,
            )?;
            self.stats.max_derivative_deviation = Some(deviation);
        }
        self.index = Some(index);
        Ok(())
    }
}

/// Union of the factors' optimized keys, in first-seen order.
fn default_optimized_keys(factors: &[Factor]) -> Vec<Key> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for factor in factors {
        for &key in factor.optimized_keys() {
            if seen.insert(key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// One-call wrapper: build an [`Optimizer`] and run it once.
pub fn optimize(
    params: OptimizerParams,
    factors: Vec<Factor>,
    values: &mut Values,
    epsilon: f64,
) -> OptimizerResult<OptimizationStats> {
    let mut optimizer = Optimizer::new(params, factors, epsilon)?;
    optimizer.optimize(values)?;
    Ok(optimizer.stats().clone())
}
