//! Manifold representations for optimization on non-Euclidean spaces.
//!
//! Optimization variables live on smooth manifolds: Euclidean vectors,
//! rotations, rigid-body poses. Each type knows its packed storage layout,
//! the dimension of its local tangent space, and how to move along the
//! manifold by a tangent increment (retraction) or measure the tangent
//! increment between two nearby elements (local coordinates).
//!
//! | Type  | Storage                          | Tangent | Retraction            |
//! |-------|----------------------------------|---------|-----------------------|
//! | `Rn`  | `[x1..xn]`                       | n       | vector addition       |
//! | `SO3` | unit quaternion `[w, x, y, z]`   | 3       | `R ∘ exp([w]x)`       |
//! | `SE3` | `[tx, ty, tz, qw, qx, qy, qz]`   | 6       | `(t + v, R ∘ exp(w))` |
//!
//! Every operation that can hit a singularity (quaternion log at the
//! identity, axis extraction at zero angle) takes an `epsilon` scalar that
//! selects the small-angle branch near the singular point. The optimizer
//! threads a single epsilon through all manifold calls.

use nalgebra::DVector;
use thiserror::Error;

pub mod rn;
pub mod se3;
pub mod so3;

pub use rn::Rn;
pub use se3::SE3;
pub use so3::SO3;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// Packed storage buffer has the wrong number of scalars
    #[error("Invalid storage dimension: expected {expected}, got {actual}")]
    InvalidStorageDimension { expected: usize, actual: usize },

    /// Tangent increment has the wrong dimension
    #[error("Invalid tangent dimension: expected {expected}, got {actual}")]
    InvalidTangentDimension { expected: usize, actual: usize },

    /// NaN or Inf detected in a manifold element
    #[error("Invalid number: NaN or Inf detected")]
    InvalidNumber,
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Core contract every optimizable type satisfies.
///
/// A manifold element knows how many scalars its packed representation
/// occupies (`storage_dim`), the dimension of its local linear
/// parameterization (`tangent_dim`, which may be smaller than the storage
/// dimension for over-parameterized representations such as unit
/// quaternions), and how to serialize, retract, and compute local
/// coordinates.
pub trait Manifold: Clone {
    /// Number of scalars in the packed representation.
    fn storage_dim(&self) -> usize;

    /// Dimension of the local tangent-space parameterization.
    fn tangent_dim(&self) -> usize;

    /// Serialize into a packed storage vector.
    fn to_storage(&self) -> DVector<f64>;

    /// Deserialize from a packed storage vector.
    fn from_storage(data: &[f64]) -> ManifoldResult<Self>;

    /// Move along the manifold by a tangent increment: `x ⊞ delta`.
    ///
    /// First-order approximation to the exponential map near `self`.
    fn retract(&self, delta: &[f64], epsilon: f64) -> ManifoldResult<Self>;

    /// Tangent vector taking `self` to `other`: inverse of [`Manifold::retract`].
    ///
    /// `retract(x, local_coordinates(x, y)) ≈ y` for `y` near `x`.
    fn local_coordinates(&self, other: &Self, epsilon: f64) -> DVector<f64>;
}

/// Group operations for manifolds that are Lie groups.
pub trait LieGroup: Manifold {
    /// The group identity element.
    fn identity() -> Self;

    /// Group composition `self ∘ other`.
    fn compose(&self, other: &Self) -> Self;

    /// Group inverse.
    fn inverse(&self) -> Self;

    /// Relative transformation `self⁻¹ ∘ other`.
    fn between(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }
}
