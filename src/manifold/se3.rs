//! SE(3) rigid-body transformations.
//!
//! Storage is `[tx, ty, tz, qw, qx, qy, qz]` (7 scalars), the tangent space
//! is `[vx, vy, vz, wx, wy, wz]` (6 degrees of freedom, translation first).
//! The retraction treats SE(3) as the product manifold R³ × SO(3):
//! translation moves additively while the rotation retracts through its own
//! exponential map. Group operations (compose, inverse, between) use the
//! full rigid-body semantics.

use nalgebra::{DVector, Vector3};

use crate::manifold::{LieGroup, Manifold, ManifoldError, ManifoldResult, SO3};

/// Rigid-body transformation: rotation plus translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    rotation: SO3,
    translation: Vector3<f64>,
}

impl SE3 {
    /// Storage size of the packed representation.
    pub const STORAGE_DIM: usize = 7;
    /// Degrees of freedom of the rigid-body group.
    pub const DOF: usize = 6;

    /// Create from rotation and translation parts.
    pub fn new(rotation: SO3, translation: Vector3<f64>) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    /// The rotation part.
    pub fn rotation(&self) -> &SO3 {
        &self.rotation
    }

    /// The translation part.
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Transform a point: `R p + t`.
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.act(point) + self.translation
    }

    /// A random transformation with bounded translation, for tests.
    pub fn random() -> Self {
        SE3 {
            rotation: SO3::random(),
            translation: Vector3::new(
                rand::random::<f64>() * 2.0 - 1.0,
                rand::random::<f64>() * 2.0 - 1.0,
                rand::random::<f64>() * 2.0 - 1.0,
            ),
        }
    }
}

impl Manifold for SE3 {
    fn storage_dim(&self) -> usize {
        Self::STORAGE_DIM
    }

    fn tangent_dim(&self) -> usize {
        Self::DOF
    }

    fn to_storage(&self) -> DVector<f64> {
        let q = self.rotation.quaternion().quaternion();
        DVector::from_row_slice(&[
            self.translation.x,
            self.translation.y,
            self.translation.z,
            q.w,
            q.i,
            q.j,
            q.k,
        ])
    }

    fn from_storage(data: &[f64]) -> ManifoldResult<Self> {
        if data.len() != Self::STORAGE_DIM {
            return Err(ManifoldError::InvalidStorageDimension {
                expected: Self::STORAGE_DIM,
                actual: data.len(),
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }
        Ok(SE3 {
            translation: Vector3::new(data[0], data[1], data[2]),
            rotation: SO3::from_quaternion_coeffs(data[3], data[4], data[5], data[6]),
        })
    }

    fn retract(&self, delta: &[f64], epsilon: f64) -> ManifoldResult<Self> {
        if delta.len() != Self::DOF {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: Self::DOF,
                actual: delta.len(),
            });
        }
        let translation =
            self.translation + Vector3::new(delta[0], delta[1], delta[2]);
        let rotation = self.rotation.retract(&delta[3..], epsilon)?;
        Ok(SE3 {
            rotation,
            translation,
        })
    }

    fn local_coordinates(&self, other: &Self, epsilon: f64) -> DVector<f64> {
        let dt = other.translation - self.translation;
        let dr = self.rotation.local_coordinates(&other.rotation, epsilon);
        DVector::from_row_slice(&[dt.x, dt.y, dt.z, dr[0], dr[1], dr[2]])
    }
}

impl LieGroup for SE3 {
    fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SE3 {
            rotation: self.rotation.compose(&other.rotation),
            translation: self.rotation.act(&other.translation) + self.translation,
        }
    }

    fn inverse(&self) -> Self {
        let rotation_inv = self.rotation.inverse();
        let translation = -rotation_inv.act(&self.translation);
        SE3 {
            rotation: rotation_inv,
            translation,
        }
    }
}
