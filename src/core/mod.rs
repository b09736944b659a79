//! Core problem-definition types: keys, the values container, and factors.

use thiserror::Error;
use tracing::error;

pub mod factor;
pub mod key;
pub mod values;

pub use factor::{Factor, FactorLinearization};
pub use key::Key;
pub use values::{IndexEntry, ManifoldEntry, ManifoldValue, Values, ValuesIndex};

/// Errors from the problem-definition layer.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A key was referenced that is not present in the values
    #[error("Unknown key: {0}")]
    UnknownKey(Key),

    /// A value was retrieved with the wrong type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A vector or index had an unexpected dimension
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A factor functor misbehaved (wrong outputs, evaluation failure)
    #[error("Factor evaluation failed: {0}")]
    FactorEvaluation(String),

    /// Manifold operation failed
    #[error("Manifold error: {0}")]
    Manifold(#[from] crate::manifold::ManifoldError),
}

impl CoreError {
    /// Log the error at error level and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
