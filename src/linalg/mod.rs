//! Sparse linear-algebra backend for the damped normal equations.
//!
//! The optimizer hands the linear solver a symmetric positive-definite
//! (after damping) sparse system and a right-hand side; the solver factors
//! it and solves. The symbolic analysis is performed once, since the
//! sparsity pattern of the damped Hessian is persistent across iterations,
//! and only the numeric factorization repeats.

use faer::Mat;
use faer::sparse::{SparseColMat, SymbolicSparseColMatRef};
use thiserror::Error;
use tracing::error;

pub mod ldlt;

pub use ldlt::SparseLdltSolver;

/// Linear-algebra error types.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Numeric factorization failed (zero or negative pivot, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Symbolic analysis of the sparsity pattern failed
    #[error("Symbolic factorization failed: {0}")]
    SymbolicFactorizationFailed(String),

    /// Solve was called before a successful factorization
    #[error("Solve called without a prior factorization")]
    NotFactorized,

    /// Failed to create a sparse matrix
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),
}

impl LinAlgError {
    /// Log the error at error level and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from a third-party
    /// library, then return self for chaining.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear-algebra operations.
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Sparse symmetric linear solver contract.
///
/// `factorize_symbolic` runs the fill-reducing analysis once for a given
/// sparsity pattern; `factorize` performs the numeric factorization of a
/// matrix with that pattern; `solve` applies the factorization to a
/// right-hand side. Numeric factorization failure is reported as an error,
/// never a panic, so the optimizer can treat it as a rejected step.
pub trait SparseLinearSolver {
    /// Analyze the sparsity pattern. Called once; subsequent `factorize`
    /// calls must pass matrices with this pattern.
    fn factorize_symbolic(&mut self, pattern: SymbolicSparseColMatRef<'_, usize>)
    -> LinAlgResult<()>;

    /// Numerically factorize `matrix` (lower triangle is read).
    fn factorize(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<()>;

    /// Solve against the last successful factorization.
    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>>;
}
