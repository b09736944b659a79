//! Residual factors.
//!
//! A [`Factor`] couples an ordered list of input keys with a residual
//! functor. The functor receives the packed storage vectors of its inputs
//! in declared order and produces the factor-local linearization; the
//! factor itself never sees its global row or column offsets; the
//! linearizer supplies those.
//!
//! Two factory forms are supported:
//!
//! - **Jacobian form**: the functor returns `(r, J)` with `J` laid out over
//!   the optimized keys in declaration order. A `compute_jacobian` flag
//!   lets the caller skip the Jacobian when only the residual is needed
//!   (step evaluation).
//! - **Hessian form**: the functor returns `(r, J^T J, J^T r)` directly,
//!   for factors that can form the normal-equation blocks more cheaply
//!   than materializing `J`.

use nalgebra::{DMatrix, DVector};

use crate::core::key::Key;
use crate::core::values::Values;
use crate::core::{CoreError, CoreResult};

/// Jacobian-form residual functor: `(storage inputs, compute_jacobian) ->
/// (r, Some(J) when requested)`.
pub type JacobianFunc =
    dyn Fn(&[DVector<f64>], bool) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)>
        + Send
        + Sync;

/// Hessian-form residual functor: `storage inputs -> (r, J^T J, J^T r)`.
pub type HessianFunc =
    dyn Fn(&[DVector<f64>]) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)>
        + Send
        + Sync;

enum FactorFunc {
    Jacobian(Box<JacobianFunc>),
    Hessian(Box<HessianFunc>),
}

/// Factor-local linearization in the factor's own tangent coordinates.
///
/// `jacobian` is populated for Jacobian-form factors when requested;
/// `hessian`/`rhs` are populated for Hessian-form factors.
#[derive(Debug, Clone)]
pub struct FactorLinearization {
    pub residual: DVector<f64>,
    pub jacobian: Option<DMatrix<f64>>,
    pub hessian: Option<DMatrix<f64>>,
    pub rhs: Option<DVector<f64>>,
}

/// A residual term over a subset of the problem variables.
///
/// Immutable after construction. The residual dimension is fixed for the
/// lifetime of the factor; the linearizer validates this across
/// iterations.
pub struct Factor {
    func: FactorFunc,
    keys: Vec<Key>,
    optimized_keys: Vec<Key>,
}

impl Factor {
    /// Build a Jacobian-form factor over `keys`; all keys are optimized.
    pub fn jacobian<F>(func: F, keys: Vec<Key>) -> Self
    where
        F: Fn(&[DVector<f64>], bool) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)>
            + Send
            + Sync
            + 'static,
    {
        let optimized_keys = keys.clone();
        Factor {
            func: FactorFunc::Jacobian(Box::new(func)),
            keys,
            optimized_keys,
        }
    }

    /// Build a Jacobian-form factor where only `optimized_keys` (a subset
    /// of `keys`, in declaration order) are optimized; the remaining keys
    /// are constants that feed residual evaluation only.
    pub fn jacobian_with_constants<F>(func: F, keys: Vec<Key>, optimized_keys: Vec<Key>) -> Self
    where
        F: Fn(&[DVector<f64>], bool) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)>
            + Send
            + Sync
            + 'static,
    {
        Factor {
            func: FactorFunc::Jacobian(Box::new(func)),
            keys,
            optimized_keys,
        }
    }

    /// Build a Hessian-form factor over `keys`; all keys are optimized.
    pub fn hessian<F>(func: F, keys: Vec<Key>) -> Self
    where
        F: Fn(&[DVector<f64>]) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)>
            + Send
            + Sync
            + 'static,
    {
        let optimized_keys = keys.clone();
        Factor {
            func: FactorFunc::Hessian(Box::new(func)),
            keys,
            optimized_keys,
        }
    }

    /// All input keys, in declaration order.
    pub fn all_keys(&self) -> &[Key] {
        &self.keys
    }

    /// The subset of input keys that are optimized.
    pub fn optimized_keys(&self) -> &[Key] {
        &self.optimized_keys
    }

    /// Whether this factor can materialize a Jacobian block.
    pub fn supports_jacobian(&self) -> bool {
        matches!(self.func, FactorFunc::Jacobian(_))
    }

    /// Evaluate the factor at the current values of its input keys.
    ///
    /// For Jacobian-form factors `compute_jacobian` controls whether the
    /// Jacobian is produced; Hessian-form factors always produce their
    /// normal-equation blocks.
    pub fn linearize(
        &self,
        values: &Values,
        compute_jacobian: bool,
    ) -> CoreResult<FactorLinearization> {
        let mut params = Vec::with_capacity(self.keys.len());
        for &key in &self.keys {
            params.push(values.storage(key)?);
        }

        match &self.func {
            FactorFunc::Jacobian(func) => {
                let (residual, jacobian) = func(&params, compute_jacobian)?;
                if compute_jacobian && jacobian.is_none() {
                    return Err(CoreError::FactorEvaluation(
                        "factor returned no Jacobian although one was requested".to_string(),
                    ));
                }
                Ok(FactorLinearization {
                    residual,
                    jacobian,
                    hessian: None,
                    rhs: None,
                })
            }
            FactorFunc::Hessian(func) => {
                let (residual, hessian, rhs) = func(&params)?;
                Ok(FactorLinearization {
                    residual,
                    jacobian: None,
                    hessian: Some(hessian),
                    rhs: Some(rhs),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::Rn;
    use nalgebra::dvector;

    fn prior_factor(key: Key, target: f64) -> Factor {
        Factor::jacobian(
            move |params, compute_jacobian| {
                let residual = dvector![params[0][0] - target];
                let jacobian = compute_jacobian.then(|| DMatrix::identity(1, 1));
                Ok((residual, jacobian))
            },
            vec![key],
        )
    }

    #[test]
    fn test_jacobian_factor_linearize() {
        let key = Key::new('x', 0);
        let mut values = Values::new();
        values.set(key, Rn::from_slice(&[5.0]));

        let factor = prior_factor(key, 3.0);
        let lin = factor.linearize(&values, true).unwrap();
        assert_eq!(lin.residual, dvector![2.0]);
        assert!(lin.jacobian.is_some());
        assert!(lin.hessian.is_none());
    }

    #[test]
    fn test_jacobian_factor_residual_only() {
        let key = Key::new('x', 0);
        let mut values = Values::new();
        values.set(key, Rn::from_slice(&[5.0]));

        let factor = prior_factor(key, 3.0);
        let lin = factor.linearize(&values, false).unwrap();
        assert!(lin.jacobian.is_none());
    }

    #[test]
    fn test_hessian_factor_linearize() {
        let key = Key::new('x', 0);
        let mut values = Values::new();
        values.set(key, Rn::from_slice(&[2.0]));

        let factor = Factor::hessian(
            |params| {
                let residual = dvector![params[0][0]];
                let hessian = DMatrix::identity(1, 1);
                let rhs = residual.clone();
                Ok((residual, hessian, rhs))
            },
            vec![key],
        );
        let lin = factor.linearize(&values, false).unwrap();
        assert_eq!(lin.residual, dvector![2.0]);
        assert_eq!(lin.hessian.unwrap()[(0, 0)], 1.0);
        assert_eq!(lin.rhs.unwrap(), dvector![2.0]);
        assert!(!factor.supports_jacobian());
    }

    #[test]
    fn test_factor_with_constants_key_lists() {
        let opt = Key::new('x', 0);
        let fixed = Key::new('c', 0);
        let factor = Factor::jacobian_with_constants(
            |params, compute_jacobian| {
                let residual = dvector![params[0][0] - params[1][0]];
                let jacobian = compute_jacobian.then(|| DMatrix::identity(1, 1));
                Ok((residual, jacobian))
            },
            vec![opt, fixed],
            vec![opt],
        );
        assert_eq!(factor.all_keys(), &[opt, fixed]);
        assert_eq!(factor.optimized_keys(), &[opt]);
    }

    #[test]
    fn test_linearize_missing_key() {
        let factor = prior_factor(Key::new('x', 0), 0.0);
        let values = Values::new();
        assert!(factor.linearize(&values, true).is_err());
    }
}
