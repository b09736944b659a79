//! Euclidean vector space Rⁿ.
//!
//! The trivial manifold: storage and tangent space coincide, retraction is
//! vector addition and local coordinates are vector subtraction. Used for
//! landmarks, biases, scalar parameters, and anything else without
//! curvature.

use nalgebra::DVector;

use crate::manifold::{Manifold, ManifoldError, ManifoldResult};

/// Element of the Euclidean space Rⁿ with dynamic dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Rn {
    data: DVector<f64>,
}

impl Rn {
    /// Create a new Rⁿ element from a vector.
    pub fn new(data: DVector<f64>) -> Self {
        Rn { data }
    }

    /// Create a new Rⁿ element from a slice.
    pub fn from_slice(data: &[f64]) -> Self {
        Rn {
            data: DVector::from_row_slice(data),
        }
    }

    /// The zero vector of the given dimension.
    pub fn zeros(dim: usize) -> Self {
        Rn {
            data: DVector::zeros(dim),
        }
    }

    /// Borrow the underlying vector.
    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// Whether the vector has zero components.
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }
}

impl From<DVector<f64>> for Rn {
    fn from(data: DVector<f64>) -> Self {
        Rn::new(data)
    }
}

impl From<Rn> for DVector<f64> {
    fn from(value: Rn) -> Self {
        value.data
    }
}

impl Manifold for Rn {
    fn storage_dim(&self) -> usize {
        self.data.nrows()
    }

    fn tangent_dim(&self) -> usize {
        self.data.nrows()
    }

    fn to_storage(&self) -> DVector<f64> {
        self.data.clone()
    }

    fn from_storage(data: &[f64]) -> ManifoldResult<Self> {
        Ok(Rn::from_slice(data))
    }

    fn retract(&self, delta: &[f64], _epsilon: f64) -> ManifoldResult<Self> {
        if delta.len() != self.data.nrows() {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: self.data.nrows(),
                actual: delta.len(),
            });
        }
        let mut data = self.data.clone();
        for (value, d) in data.iter_mut().zip(delta) {
            *value += d;
        }
        Ok(Rn { data })
    }

    fn local_coordinates(&self, other: &Self, _epsilon: f64) -> DVector<f64> {
        &other.data - &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rn_dimensions() {
        let v = Rn::from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(v.storage_dim(), 3);
        assert_eq!(v.tangent_dim(), 3);
    }

    #[test]
    fn test_rn_retract_is_addition() {
        let v = Rn::from_slice(&[1.0, 2.0]);
        let moved = v.retract(&[0.5, -1.0], 1e-9).unwrap();
        assert_eq!(moved.data(), &DVector::from_row_slice(&[1.5, 1.0]));
    }

    #[test]
    fn test_rn_local_coordinates_is_subtraction() {
        let a = Rn::from_slice(&[1.0, 2.0]);
        let b = Rn::from_slice(&[4.0, 0.0]);
        let local = a.local_coordinates(&b, 1e-9);
        assert_eq!(local, DVector::from_row_slice(&[3.0, -2.0]));
    }

    #[test]
    fn test_rn_retract_dimension_mismatch() {
        let v = Rn::from_slice(&[1.0, 2.0]);
        assert!(v.retract(&[0.5], 1e-9).is_err());
    }

    #[test]
    fn test_rn_storage_round_trip() {
        let v = Rn::from_slice(&[1.0, -2.0, 0.25]);
        let storage = v.to_storage();
        let recovered = Rn::from_storage(storage.as_slice()).unwrap();
        assert_eq!(recovered, v);
    }
}
