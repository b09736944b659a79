//! Error types for the summit-solver library.
//!
//! Each module defines its own error enum; this module aggregates them
//! into the crate-level [`SummitError`] so applications can bubble any
//! failure through a single result type. All errors use the `thiserror`
//! crate for automatic trait implementations.

use thiserror::Error;

use crate::core::CoreError;
use crate::linalg::LinAlgError;
use crate::manifold::ManifoldError;
use crate::optimizer::OptimizerError;

/// Main result type used throughout the summit-solver library.
pub type SummitResult<T> = Result<T, SummitError>;

/// Main error type for the summit-solver library.
#[derive(Debug, Clone, Error)]
pub enum SummitError {
    /// Problem-definition errors (keys, values, factors)
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Manifold operation errors
    #[error("Manifold error: {0}")]
    Manifold(#[from] ManifoldError),

    /// Linear algebra errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(#[from] LinAlgError),

    /// Optimizer errors
    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
}
