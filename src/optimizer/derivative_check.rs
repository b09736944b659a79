//! Numerical cross-check of analytic factor Jacobians.
//!
//! When `check_derivatives` is enabled the first linearization is wrapped
//! with a central-difference probe: each optimized key of each
//! Jacobian-form factor is perturbed through the manifold retraction and
//! the finite-difference residual slope is compared against the analytic
//! Jacobian column. Disagreement is reported, not fatal: a noisy check can
//! flag a factor without aborting an otherwise usable optimization.

use tracing::warn;

use crate::core::factor::Factor;
use crate::core::values::{Values, ValuesIndex};
use crate::optimizer::OptimizerResult;

const STEP: f64 = 1e-6;
const WARN_TOLERANCE: f64 = 1e-4;

/// Compare analytic and central-difference Jacobians of every
/// Jacobian-form factor at `values`. Returns the maximum absolute
/// deviation observed; warns per factor above tolerance.
pub(crate) fn check_factor_derivatives(
    factors: &[Factor],
    values: &Values,
    index: &ValuesIndex,
    epsilon: f64,
) -> OptimizerResult<f64> {
    let mut max_deviation = 0.0_f64;

    for (factor_idx, factor) in factors.iter().enumerate() {
        if !factor.supports_jacobian() {
            continue;
        }
        let analytic = factor.linearize(values, true)?;
        let jacobian = analytic
            .jacobian
            .as_ref()
            .expect("Jacobian-form factors produce a Jacobian");

        let mut factor_deviation = 0.0_f64;
        let mut local_offset = 0;
        for &key in factor.optimized_keys() {
            let entry = index.entry(key).expect("linearizer validated factor keys");
            let key_index = values.create_index(&[key])?;

            for j in 0..entry.tangent_dim {
                let mut delta = vec![0.0; entry.tangent_dim];

                delta[j] = STEP;
                let mut plus = values.clone();
                plus.retract(&key_index, &delta, epsilon)?;
                let residual_plus = factor.linearize(&plus, false)?.residual;

                delta[j] = -STEP;
                let mut minus = values.clone();
                minus.retract(&key_index, &delta, epsilon)?;
                let residual_minus = factor.linearize(&minus, false)?.residual;

                for r in 0..residual_plus.nrows() {
                    let numeric = (residual_plus[r] - residual_minus[r]) / (2.0 * STEP);
                    let deviation = (numeric - jacobian[(r, local_offset + j)]).abs();
                    factor_deviation = factor_deviation.max(deviation);
                }
            }
            local_offset += entry.tangent_dim;
        }

        if factor_deviation > WARN_TOLERANCE {
            warn!(
                "factor {} analytic Jacobian deviates from central differences by {:.3e}",
                factor_idx, factor_deviation
            );
        }
        max_deviation = max_deviation.max(factor_deviation);
    }

    Ok(max_deviation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::Key;
    use crate::manifold::Rn;
    use nalgebra::{DVector, dmatrix, dvector};

    #[test]
    fn test_correct_jacobian_has_small_deviation() {
        let x0 = Key::new('x', 0);
        let mut values = Values::new();
        values.set(x0, Rn::from_slice(&[2.0]));
        let index = values.create_index(&[x0]).unwrap();

        let factors = vec![Factor::jacobian(
            |params: &[DVector<f64>], compute_jacobian| {
                let x = params[0][0];
                let residual = dvector![x * x - 1.0];
                let jacobian = compute_jacobian.then(|| dmatrix![2.0 * x]);
                Ok((residual, jacobian))
            },
            vec![x0],
        )];

        let deviation = check_factor_derivatives(&factors, &values, &index, 1e-9).unwrap();
        assert!(deviation < 1e-6, "deviation was {deviation}");
    }

    #[test]
    fn test_wrong_jacobian_is_detected() {
        let x0 = Key::new('x', 0);
        let mut values = Values::new();
        values.set(x0, Rn::from_slice(&[2.0]));
        let index = values.create_index(&[x0]).unwrap();

        let factors = vec![Factor::jacobian(
            |params: &[DVector<f64>], compute_jacobian| {
                let x = params[0][0];
                let residual = dvector![x * x - 1.0];
                // Deliberately wrong derivative
                let jacobian = compute_jacobian.then(|| dmatrix![3.0 * x]);
                Ok((residual, jacobian))
            },
            vec![x0],
        )];

        let deviation = check_factor_derivatives(&factors, &values, &index, 1e-9).unwrap();
        assert!(deviation > 1.0, "deviation was {deviation}");
    }
}
