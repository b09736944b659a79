//! # Summit Solver
//!
//! A sparse nonlinear least-squares optimizer for factor-graph problems:
//! bundle adjustment, pose-graph optimization, sensor calibration, and any
//! estimation task expressed as residual factors over manifold-valued
//! variables.
//!
//! ## Features
//!
//! - **Factor graphs over named variables**: factors reference variables
//!   through compact [`Key`]s into a heterogeneous [`Values`] container
//! - **Manifold-aware**: rotations, poses, and vectors update through
//!   retraction in their tangent spaces
//! - **Sparse by construction**: the sparsity pattern of the Gauss-Newton
//!   Hessian is computed once and refilled each iteration
//! - **Levenberg-Marquardt driver**: adaptive damping with configurable
//!   Marquardt (diagonal) or Levenberg (unit) scaling
//! - **Marginal covariances**: full inversion or Schur-complement
//!   marginalization for a subset of keys
//! - **Built on faer**: sparse LDL^T factorization with a cached symbolic
//!   analysis
//!
//! ## Example
//!
//! ```
//! use nalgebra::{DMatrix, dvector};
//! use summit_solver::manifold::Rn;
//! use summit_solver::{Factor, Key, Optimizer, OptimizerParams, Values};
//!
//! // One scalar variable pulled toward 3.0
//! let x0 = Key::new('x', 0);
//! let mut values = Values::new();
//! values.set(x0, Rn::from_slice(&[0.0]));
//!
//! let factors = vec![Factor::jacobian(
//!     |params: &[nalgebra::DVector<f64>], compute_jacobian| {
//!         let residual = dvector![params[0][0] - 3.0];
//!         let jacobian = compute_jacobian.then(|| DMatrix::identity(1, 1));
//!         Ok((residual, jacobian))
//!     },
//!     vec![x0],
//! )];
//!
//! let mut optimizer = Optimizer::new(OptimizerParams::default(), factors, 1e-9).unwrap();
//! let converged = optimizer.optimize(&mut values).unwrap();
//! assert!(converged);
//! ```

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod optimizer;

// Re-export the primary problem-definition types
pub use crate::core::{Factor, FactorLinearization, Key, ManifoldValue, Values, ValuesIndex};

pub use error::{SummitError, SummitResult};

pub use linalg::{SparseLdltSolver, SparseLinearSolver};

pub use logger::{init_iteration_logger, init_logger};

// Re-export the optimizer surface
pub use optimizer::{
    Linearization, Linearizer, OptimizationStats, OptimizationStatus, Optimizer, OptimizerParams,
    optimize,
};
