//! Marginal covariance extraction.
//!
//! At an optimum the inverse of the Gauss-Newton Hessian is the marginal
//! covariance of the estimate. Two paths are provided:
//!
//! - full inversion of the (epsilon-regularized) dense Hessian, extracting
//!   every key's diagonal block;
//! - Schur-complement marginalization for a prefix subset of keys:
//!   partition `H = [B E; E^T C]`, form `S = B - E C^{-1} E^T` and invert
//!   only `S`. When `C` is block-diagonal (the usual structure when the
//!   complement keys are landmarks) `C^{-1}` is computed block by block;
//!   otherwise a dense Cholesky solve of `C` is used.
//!
//! Covariance sizes are per-key tangent dimensions, so the dense math here
//! runs on nalgebra; the sparse Hessian only gets densified once.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::core::key::Key;
use crate::core::values::IndexEntry;
use crate::optimizer::linearizer::Linearization;
use crate::optimizer::{OptimizerError, OptimizerResult};

/// Densify the lower-triangle sparse Hessian into a symmetric matrix and
/// regularize the diagonal with `epsilon`.
pub(crate) fn dense_hessian(linearization: &Linearization, epsilon: f64) -> DMatrix<f64> {
    let n = linearization.tangent_dim();
    let mut dense = DMatrix::zeros(n, n);
    for triplet in linearization.hessian_lower.triplet_iter() {
        dense[(triplet.row, triplet.col)] = *triplet.val;
        dense[(triplet.col, triplet.row)] = *triplet.val;
    }
    for i in 0..n {
        dense[(i, i)] += epsilon;
    }
    dense
}

/// Invert a symmetric positive-definite matrix, Cholesky first with a
/// general inverse as fallback for semi-definite edge cases.
pub(crate) fn invert_spd(matrix: &DMatrix<f64>) -> OptimizerResult<DMatrix<f64>> {
    if let Some(cholesky) = matrix.clone().cholesky() {
        return Ok(cholesky.inverse());
    }
    matrix.clone().try_inverse().ok_or_else(|| {
        OptimizerError::Numerical("Hessian is singular, covariance unavailable".to_string()).log()
    })
}

/// Copy per-key diagonal blocks of `full` into `out`, reusing existing
/// entries and dropping keys that are not requested.
pub(crate) fn extract_key_covariances(
    full: &DMatrix<f64>,
    entries: &[IndexEntry],
    out: &mut HashMap<Key, DMatrix<f64>>,
) {
    out.retain(|key, _| entries.iter().any(|entry| entry.key == *key));
    for entry in entries {
        let dim = entry.tangent_dim;
        let block = out
            .entry(entry.key)
            .or_insert_with(|| DMatrix::zeros(dim, dim));
        if block.nrows() != dim || block.ncols() != dim {
            *block = DMatrix::zeros(dim, dim);
        }
        for r in 0..dim {
            for c in 0..dim {
                block[(r, c)] = full[(entry.tangent_offset + r, entry.tangent_offset + c)];
            }
        }
    }
}

/// Whether the complement block `C` (rows/cols at and beyond `split`) has
/// no coupling between different keys, judged from the sparse lower
/// triangle. `complement_blocks` lists `(tangent_offset, tangent_dim)` of
/// the complement keys.
pub(crate) fn complement_is_block_diagonal(
    linearization: &Linearization,
    split: usize,
    complement_blocks: &[(usize, usize)],
) -> bool {
    let block_of = |i: usize| {
        complement_blocks
            .iter()
            .position(|&(start, dim)| i >= start && i < start + dim)
    };
    for triplet in linearization.hessian_lower.triplet_iter() {
        if triplet.row >= split && triplet.col >= split && triplet.row != triplet.col {
            if block_of(triplet.row) != block_of(triplet.col) {
                return false;
            }
        }
    }
    true
}

/// Covariance of the first `split` tangent coordinates through the Schur
/// complement `S = B - E C^{-1} E^T`.
pub(crate) fn schur_covariance(
    hessian: &DMatrix<f64>,
    split: usize,
    complement_blocks: &[(usize, usize)],
    block_diagonal: bool,
) -> OptimizerResult<DMatrix<f64>> {
    let n = hessian.nrows();
    let c_dim = n - split;
    let b = hessian.view((0, 0), (split, split)).into_owned();
    if c_dim == 0 {
        return invert_spd(&b);
    }
    let e = hessian.view((0, split), (split, c_dim)).into_owned();
    let c = hessian.view((split, split), (c_dim, c_dim)).into_owned();

    // X = C^{-1} E^T
    let x = if block_diagonal {
        let mut x = DMatrix::zeros(c_dim, split);
        for &(start, dim) in complement_blocks {
            let local = start - split;
            let c_block = c.view((local, local), (dim, dim)).into_owned();
            let c_block_inv = invert_spd(&c_block)?;
            let e_block = e.view((0, local), (split, dim)).into_owned();
            x.view_mut((local, 0), (dim, split))
                .copy_from(&(c_block_inv * e_block.transpose()));
        }
        x
    } else {
        let cholesky = c.cholesky().ok_or_else(|| {
            OptimizerError::Numerical(
                "complement block is not positive definite".to_string(),
            )
            .log()
        })?;
        cholesky.solve(&e.transpose())
    };

    let schur = b - e * x;
    invert_spd(&schur)
}
