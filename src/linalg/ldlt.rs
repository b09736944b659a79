//! Sparse LDL^T factorization on faer's simplicial solver.

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Ldlt, SymbolicLdlt};
use faer::sparse::{SparseColMat, SymbolicSparseColMatRef};
use faer::{Mat, Side};

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// LDL^T solver for sparse symmetric systems.
///
/// Caches the symbolic factorization across iterations: the damped Hessian
/// keeps one sparsity pattern for the whole optimization, so the
/// fill-reducing analysis runs once and only the numeric factorization
/// repeats.
pub struct SparseLdltSolver {
    symbolic: Option<SymbolicLdlt<usize>>,
    factorization: Option<Ldlt<usize, f64>>,
}

impl SparseLdltSolver {
    pub fn new() -> Self {
        SparseLdltSolver {
            symbolic: None,
            factorization: None,
        }
    }

    /// Whether a numeric factorization is available.
    pub fn is_factorized(&self) -> bool {
        self.factorization.is_some()
    }
}

impl Default for SparseLdltSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseLinearSolver for SparseLdltSolver {
    fn factorize_symbolic(
        &mut self,
        pattern: SymbolicSparseColMatRef<'_, usize>,
    ) -> LinAlgResult<()> {
        let symbolic = SymbolicLdlt::try_new(pattern, Side::Lower).map_err(|e| {
            LinAlgError::SymbolicFactorizationFailed(
                "symbolic LDL^T analysis failed".to_string(),
            )
            .log_with_source(e)
        })?;
        self.symbolic = Some(symbolic);
        self.factorization = None;
        Ok(())
    }

    fn factorize(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<()> {
        let symbolic = if let Some(cached) = &self.symbolic {
            // SymbolicLdlt is reference-counted, clone is cheap
            cached.clone()
        } else {
            let symbolic =
                SymbolicLdlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::SymbolicFactorizationFailed(
                        "symbolic LDL^T analysis failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
            self.symbolic = Some(symbolic.clone());
            symbolic
        };

        match Ldlt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower) {
            Ok(factorization) => {
                self.factorization = Some(factorization);
                Ok(())
            }
            Err(e) => {
                self.factorization = None;
                Err(LinAlgError::FactorizationFailed(
                    "numeric LDL^T factorization failed".to_string(),
                )
                .log_with_source(e))
            }
        }
    }

    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let factorization = self
            .factorization
            .as_ref()
            .ok_or(LinAlgError::NotFactorized)?;
        Ok(factorization.solve(rhs))
    }
}
