//! Global sparse linearization assembly.
//!
//! The [`Linearizer`] turns a snapshot of the values into a
//! [`Linearization`]: stacked residual `R`, sparse Gauss-Newton Hessian
//! `H = J^T J` (lower triangle), gradient `g = J^T R`, and optionally the
//! sparse Jacobian `J` itself.
//!
//! The expensive symbolic work happens exactly once. [`Linearizer::initialize`]
//! runs every factor at the initial values to discover residual dimensions,
//! assigns each factor a row range (insertion order) and each optimized key
//! a column range (from the [`ValuesIndex`]), and builds two persistent
//! sparsity patterns:
//!
//! - the rectangular Jacobian pattern: one dense block per (factor, key);
//! - the symmetric Hessian pattern: the union over factors of the products
//!   of their key column ranges, materialized as the lower triangle only
//!   (diagonal blocks keep their lower half, strictly-upper blocks are
//!   implicit by symmetry).
//!
//! Both patterns are created through faer's index-list constructor, which
//! returns an argsort mapping from the original entry order to the
//! compressed layout. [`Linearizer::relinearize`] then degenerates to a
//! straight-line refill: walk the factors in the same deterministic order,
//! append each block's numbers to a flat value buffer, and let
//! `new_from_argsort` scatter them into place; entries touched by several
//! factors accumulate by summation. Factor evaluation itself may fan out in
//! parallel (the `parallel` feature); the scatter stays sequential so the
//! floating-point reduction order is fixed.

use faer::Mat;
use faer::sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat};
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::factor::{Factor, FactorLinearization};
use crate::core::values::{Values, ValuesIndex};
use crate::optimizer::{OptimizerError, OptimizerResult};

/// Where one optimized key of one factor lands in the local and global
/// tangent layouts.
#[derive(Debug, Clone, Copy)]
struct KeyBlock {
    global_offset: usize,
    local_offset: usize,
    dim: usize,
}

/// Per-factor assembly bookkeeping, fixed at initialization.
#[derive(Debug, Clone)]
struct FactorSlot {
    row_offset: usize,
    residual_dim: usize,
    local_tangent_dim: usize,
    blocks: Vec<KeyBlock>,
}

/// The problem linearized at a specific values snapshot.
#[derive(Debug, Clone)]
pub struct Linearization {
    /// Stacked residual vector `R` (one column)
    pub residual: Mat<f64>,
    /// Sparse Jacobian, present only when requested
    pub jacobian: Option<SparseColMat<usize, f64>>,
    /// Lower triangle of the Gauss-Newton Hessian `J^T J`
    pub hessian_lower: SparseColMat<usize, f64>,
    /// Gradient `g = J^T R` (one column)
    pub gradient: Mat<f64>,
}

impl Linearization {
    /// Total squared-residual error `0.5 * ||R||^2`.
    pub fn error(&self) -> f64 {
        let norm = self.residual.norm_l2();
        0.5 * norm * norm
    }

    /// Infinity norm of the gradient.
    pub fn gradient_max_norm(&self) -> f64 {
        let mut max = 0.0_f64;
        for i in 0..self.gradient.nrows() {
            max = max.max(self.gradient[(i, 0)].abs());
        }
        max
    }

    /// Diagonal of the Hessian as a dense vector.
    pub fn hessian_diagonal(&self) -> Vec<f64> {
        let mut diagonal = vec![0.0; self.gradient.nrows()];
        for triplet in self.hessian_lower.triplet_iter() {
            if triplet.row == triplet.col {
                diagonal[triplet.row] = *triplet.val;
            }
        }
        diagonal
    }

    /// Number of stacked residual rows.
    pub fn residual_dim(&self) -> usize {
        self.residual.nrows()
    }

    /// Total tangent dimension of the optimized keys.
    pub fn tangent_dim(&self) -> usize {
        self.gradient.nrows()
    }
}

/// Assembles the global sparse linearization from factor-local blocks,
/// reusing a sparsity pattern computed once.
pub struct Linearizer {
    slots: Vec<FactorSlot>,
    residual_dim: usize,
    tangent_dim: usize,
    hessian_pattern: Option<(SymbolicSparseColMat<usize>, Argsort<usize>)>,
    jacobian_pattern: Option<(SymbolicSparseColMat<usize>, Argsort<usize>)>,
    // Flat value buffers in pattern entry order, reused across iterations
    hessian_values: Vec<f64>,
    jacobian_values: Vec<f64>,
}

impl Linearizer {
    pub fn new() -> Self {
        Linearizer {
            slots: Vec::new(),
            residual_dim: 0,
            tangent_dim: 0,
            hessian_pattern: None,
            jacobian_pattern: None,
            hessian_values: Vec::new(),
            jacobian_values: Vec::new(),
        }
    }

    /// Whether [`Linearizer::initialize`] has run.
    pub fn is_initialized(&self) -> bool {
        self.hessian_pattern.is_some()
    }

    /// Total residual dimension discovered at initialization.
    pub fn residual_dim(&self) -> usize {
        self.residual_dim
    }

    /// Total tangent dimension of the optimized keys.
    pub fn tangent_dim(&self) -> usize {
        self.tangent_dim
    }

    /// One-shot setup: discover per-factor residual dimensions, assign row
    /// and column ranges, and build the persistent sparsity patterns.
    ///
    /// Runs every factor once at `values`. Fails if a factor's optimized
    /// key is missing from `index` (configuration error) or a factor's
    /// output shapes are inconsistent with its key list (structural error).
    pub fn initialize(
        &mut self,
        factors: &[Factor],
        values: &Values,
        index: &ValuesIndex,
    ) -> OptimizerResult<()> {
        self.slots.clear();
        self.tangent_dim = index.tangent_dim();

        let mut row_offset = 0;
        let mut jacobian_indices = Vec::<Pair<usize, usize>>::new();
        let mut hessian_indices = Vec::<Pair<usize, usize>>::new();

        for (factor_idx, factor) in factors.iter().enumerate() {
            let local = factor.linearize(values, factor.supports_jacobian())?;
            let residual_dim = local.residual.nrows();

            let mut blocks = Vec::with_capacity(factor.optimized_keys().len());
            let mut local_offset = 0;
            for &key in factor.optimized_keys() {
                let entry = index
                    .entry(key)
                    .ok_or_else(|| OptimizerError::UnknownFactorKey(key).log())?;
                blocks.push(KeyBlock {
                    global_offset: entry.tangent_offset,
                    local_offset,
                    dim: entry.tangent_dim,
                });
                local_offset += entry.tangent_dim;
            }
            let local_tangent_dim = local_offset;

            let slot = FactorSlot {
                row_offset,
                residual_dim,
                local_tangent_dim,
                blocks,
            };
            validate_local_shapes(factor_idx, &slot, &local)?;

            // Jacobian entries: one dense block per key, row-major
            for block in &slot.blocks {
                for r in 0..residual_dim {
                    for c in 0..block.dim {
                        jacobian_indices
                            .push(Pair::new(row_offset + r, block.global_offset + c));
                    }
                }
            }

            // Hessian entries: lower triangle of the block outer product
            // over this factor's keys
            for_each_hessian_entry(&slot.blocks, |row, col, _, _| {
                hessian_indices.push(Pair::new(row, col));
            });

            row_offset += residual_dim;
            self.slots.push(slot);
        }

        self.residual_dim = row_offset;

        let jacobian_pattern = SymbolicSparseColMat::try_new_from_indices(
            self.residual_dim,
            self.tangent_dim,
            &jacobian_indices,
        )
        .map_err(|e| {
            OptimizerError::Structural(format!("failed to build Jacobian sparsity pattern: {e:?}"))
                .log()
        })?;
        let hessian_pattern = SymbolicSparseColMat::try_new_from_indices(
            self.tangent_dim,
            self.tangent_dim,
            &hessian_indices,
        )
        .map_err(|e| {
            OptimizerError::Structural(format!("failed to build Hessian sparsity pattern: {e:?}"))
                .log()
        })?;

        self.jacobian_values.reserve(jacobian_indices.len());
        self.hessian_values.reserve(hessian_indices.len());
        self.jacobian_pattern = Some(jacobian_pattern);
        self.hessian_pattern = Some(hessian_pattern);
        Ok(())
    }

    /// Refill the numerical values of the linearization at `values`,
    /// reusing the sparsity computed by [`Linearizer::initialize`].
    ///
    /// `H` and `g` are always produced; `J` only when `include_jacobian`
    /// is set, which requires every factor to be Jacobian-form.
    pub fn relinearize(
        &mut self,
        factors: &[Factor],
        values: &Values,
        include_jacobian: bool,
    ) -> OptimizerResult<Linearization> {
        if !self.is_initialized() {
            return Err(OptimizerError::NotInitialized.log());
        }
        if include_jacobian {
            if let Some(idx) = factors.iter().position(|f| !f.supports_jacobian()) {
                return Err(OptimizerError::Structural(format!(
                    "Jacobian requested but factor {idx} is Hessian-form"
                ))
                .log());
            }
        }

        // Phase 1: factor-local linearizations, parallel when enabled
        #[cfg(feature = "parallel")]
        let locals: Result<Vec<FactorLinearization>, _> = factors
            .par_iter()
            .map(|factor| factor.linearize(values, factor.supports_jacobian()))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let locals: Result<Vec<FactorLinearization>, _> = factors
            .iter()
            .map(|factor| factor.linearize(values, factor.supports_jacobian()))
            .collect();
        let locals = locals?;

        // Phase 2: sequential scatter in factor insertion order
        let mut residual = Mat::<f64>::zeros(self.residual_dim, 1);
        let mut gradient = Mat::<f64>::zeros(self.tangent_dim, 1);
        self.hessian_values.clear();
        self.jacobian_values.clear();

        for ((factor_idx, slot), local) in self.slots.iter().enumerate().zip(&locals) {
            if local.residual.nrows() != slot.residual_dim {
                return Err(OptimizerError::Structural(format!(
                    "factor {factor_idx} residual dimension changed from {} to {}",
                    slot.residual_dim,
                    local.residual.nrows()
                ))
                .log());
            }
            validate_local_shapes(factor_idx, slot, local)?;

            for r in 0..slot.residual_dim {
                residual[(slot.row_offset + r, 0)] = local.residual[r];
            }

            let (hessian_local, rhs_local) = local_normal_equation(local);

            for_each_hessian_entry(&slot.blocks, |_, _, local_row, local_col| {
                self.hessian_values.push(hessian_local[(local_row, local_col)]);
            });

            for block in &slot.blocks {
                for c in 0..block.dim {
                    gradient[(block.global_offset + c, 0)] += rhs_local[block.local_offset + c];
                }
            }

            if include_jacobian {
                let jac = local
                    .jacobian
                    .as_ref()
                    .expect("Jacobian-form factors produce a Jacobian");
                for block in &slot.blocks {
                    for r in 0..slot.residual_dim {
                        for c in 0..block.dim {
                            self.jacobian_values.push(jac[(r, block.local_offset + c)]);
                        }
                    }
                }
            }
        }

        let (hessian_pattern, hessian_order) = self
            .hessian_pattern
            .as_ref()
            .expect("checked is_initialized above");
        let hessian_lower = SparseColMat::new_from_argsort(
            hessian_pattern.clone(),
            hessian_order,
            &self.hessian_values,
        )
        .map_err(|e| {
            OptimizerError::Structural(format!("failed to assemble sparse Hessian: {e:?}")).log()
        })?;

        let jacobian = if include_jacobian {
            let (jacobian_pattern, jacobian_order) = self
                .jacobian_pattern
                .as_ref()
                .expect("checked is_initialized above");
            Some(
                SparseColMat::new_from_argsort(
                    jacobian_pattern.clone(),
                    jacobian_order,
                    &self.jacobian_values,
                )
                .map_err(|e| {
                    OptimizerError::Structural(format!(
                        "failed to assemble sparse Jacobian: {e:?}"
                    ))
                    .log()
                })?,
            )
        } else {
            None
        };

        Ok(Linearization {
            residual,
            jacobian,
            hessian_lower,
            gradient,
        })
    }
}

impl Default for Linearizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the lower-triangle Hessian entries of one factor in the canonical
/// emission order, yielding global (row, col) and the matching position in
/// the factor-local Hessian.
///
/// The same walk runs at initialization (collecting indices) and at every
/// relinearization (collecting values), so the flat value buffer lines up
/// with the argsort mapping entry for entry.
fn for_each_hessian_entry(
    blocks: &[KeyBlock],
    mut visit: impl FnMut(usize, usize, usize, usize),
) {
    for block_a in blocks {
        for block_b in blocks {
            if std::ptr::eq(block_a, block_b) {
                // Diagonal block: lower triangle only
                for r in 0..block_a.dim {
                    for c in 0..=r {
                        visit(
                            block_a.global_offset + r,
                            block_a.global_offset + c,
                            block_a.local_offset + r,
                            block_a.local_offset + c,
                        );
                    }
                }
            } else if block_a.global_offset > block_b.global_offset {
                // Strictly lower off-diagonal block: full block
                for r in 0..block_a.dim {
                    for c in 0..block_b.dim {
                        visit(
                            block_a.global_offset + r,
                            block_b.global_offset + c,
                            block_a.local_offset + r,
                            block_b.local_offset + c,
                        );
                    }
                }
            }
        }
    }
}

/// Factor-local `(J^T J, J^T r)`, taken directly from Hessian-form factors
/// or formed from the Jacobian block.
fn local_normal_equation(local: &FactorLinearization) -> (DMatrix<f64>, DVector<f64>) {
    match (&local.hessian, &local.rhs) {
        (Some(hessian), Some(rhs)) => (hessian.clone(), rhs.clone()),
        _ => {
            let jac = local
                .jacobian
                .as_ref()
                .expect("Jacobian-form factors produce a Jacobian");
            (jac.transpose() * jac, jac.transpose() * &local.residual)
        }
    }
}

fn validate_local_shapes(
    factor_idx: usize,
    slot: &FactorSlot,
    local: &FactorLinearization,
) -> OptimizerResult<()> {
    if let Some(jac) = &local.jacobian {
        if jac.nrows() != local.residual.nrows() || jac.ncols() != slot.local_tangent_dim {
            return Err(OptimizerError::Structural(format!(
                "factor {factor_idx} Jacobian is {}x{}, expected {}x{}",
                jac.nrows(),
                jac.ncols(),
                local.residual.nrows(),
                slot.local_tangent_dim
            ))
            .log());
        }
    }
    if let Some(hessian) = &local.hessian {
        if hessian.nrows() != slot.local_tangent_dim || hessian.ncols() != slot.local_tangent_dim {
            return Err(OptimizerError::Structural(format!(
                "factor {factor_idx} Hessian is {}x{}, expected {}x{}",
                hessian.nrows(),
                hessian.ncols(),
                slot.local_tangent_dim,
                slot.local_tangent_dim
            ))
            .log());
        }
    }
    if let Some(rhs) = &local.rhs {
        if rhs.nrows() != slot.local_tangent_dim {
            return Err(OptimizerError::Structural(format!(
                "factor {factor_idx} rhs has length {}, expected {}",
                rhs.nrows(),
                slot.local_tangent_dim
            ))
            .log());
        }
    }
    Ok(())
}
