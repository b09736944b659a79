//! SO(3) rotation group represented by unit quaternions.
//!
//! Storage is the quaternion `[w, x, y, z]` (4 scalars), the tangent space
//! is the axis-angle vector in R³ (3 degrees of freedom). The retraction is
//! the right-multiplied exponential map `R ⊞ w = R ∘ exp([w]ₓ)` and local
//! coordinates are its inverse `log(R₁⁻¹ ∘ R₂)`.
//!
//! The exponential and logarithmic maps are singular at zero rotation; the
//! `epsilon` argument selects a first-order branch there so derivatives
//! stay finite arbitrarily close to the identity.

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};

use crate::manifold::{LieGroup, Manifold, ManifoldError, ManifoldResult};

/// 3D rotation as a unit quaternion.
#[derive(Debug, Clone, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl SO3 {
    /// Storage size of the packed quaternion representation.
    pub const STORAGE_DIM: usize = 4;
    /// Degrees of freedom of the rotation group.
    pub const DOF: usize = 3;

    /// Create from a unit quaternion.
    pub fn from_quaternion(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Create from quaternion coefficients, normalizing the result.
    pub fn from_quaternion_coeffs(w: f64, x: f64, y: f64, z: f64) -> Self {
        SO3 {
            quaternion: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
        }
    }

    /// Exponential map: axis-angle vector to rotation.
    pub fn from_axis_angle(axis_angle: &Vector3<f64>, epsilon: f64) -> Self {
        let theta_sq = axis_angle.norm_squared();
        let quaternion = if theta_sq < epsilon * epsilon {
            // First-order expansion of exp, renormalized
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                axis_angle.x / 2.0,
                axis_angle.y / 2.0,
                axis_angle.z / 2.0,
            ))
        } else {
            UnitQuaternion::from_scaled_axis(*axis_angle)
        };
        SO3 { quaternion }
    }

    /// Logarithmic map: rotation to axis-angle vector.
    pub fn to_axis_angle(&self, epsilon: f64) -> Vector3<f64> {
        let q = self.quaternion.quaternion();
        let sin_sq = q.i * q.i + q.j * q.j + q.k * q.k;

        let coeff = if sin_sq < epsilon * epsilon {
            // Small-angle branch: q ≈ (±1, v/2)
            2.0 * q.w.signum()
        } else {
            let sin_angle = sin_sq.sqrt();
            let cos_angle = q.w;
            // Keep the angle in (-pi, pi] when the scalar part is negative
            let two_angle = 2.0
                * if cos_angle < 0.0 {
                    f64::atan2(-sin_angle, -cos_angle)
                } else {
                    f64::atan2(sin_angle, cos_angle)
                };
            two_angle / sin_angle
        };

        Vector3::new(q.i * coeff, q.j * coeff, q.k * coeff)
    }

    /// Borrow the underlying unit quaternion.
    pub fn quaternion(&self) -> &UnitQuaternion<f64> {
        &self.quaternion
    }

    /// Rotate a vector.
    pub fn act(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * vector
    }

    /// A uniformly sampled random rotation, for tests and initialization.
    pub fn random() -> Self {
        SO3 {
            quaternion: UnitQuaternion::from_scaled_axis(Vector3::new(
                rand::random::<f64>() * 2.0 - 1.0,
                rand::random::<f64>() * 2.0 - 1.0,
                rand::random::<f64>() * 2.0 - 1.0,
            )),
        }
    }
}

impl Manifold for SO3 {
    fn storage_dim(&self) -> usize {
        Self::STORAGE_DIM
    }

    fn tangent_dim(&self) -> usize {
        Self::DOF
    }

    fn to_storage(&self) -> DVector<f64> {
        let q = self.quaternion.quaternion();
        DVector::from_row_slice(&[q.w, q.i, q.j, q.k])
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
        Ok(SO3::from_quaternion_coeffs(data[0], data[1], data[2], data[3]))
    }

    fn retract(&self, delta: &[f64], epsilon: f64) -> ManifoldResult<Self> {
        if delta.len() != Self::DOF {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: Self::DOF,
                actual: delta.len(),
            });
        }
        let increment =
            SO3::from_axis_angle(&Vector3::new(delta[0], delta[1], delta[2]), epsilon);
        Ok(self.compose(&increment))
    }

    fn local_coordinates(&self, other: &Self, epsilon: f64) -> DVector<f64> {
        let relative = self.between(other);
        let axis_angle = relative.to_axis_angle(epsilon);
        DVector::from_row_slice(&[axis_angle.x, axis_angle.y, axis_angle.z])
    }
}

impl LieGroup for SO3 {
    fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SO3 {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    fn inverse(&self) -> Self {
        SO3 {
            quaternion: self.quaternion.inverse(),
        }
    }
}
