//! Heterogeneous container of manifold-valued variables.
//!
//! [`Values`] maps [`Key`]s to [`ManifoldValue`]s, a tagged enum over the
//! supported manifold types. Insertion order is preserved so that
//! iteration, index construction, and therefore the whole optimization
//! pipeline are deterministic. Lookup is by key through a hash map.
//!
//! [`ValuesIndex`] is the derived, immutable offset table over a subset of
//! keys: for each entry the storage offset/dimension and tangent
//! offset/dimension inside the concatenated state vector. It is built once
//! at optimizer initialization and consumed by the linearizer and the
//! retraction step.

use std::collections::HashMap;

use nalgebra::DVector;

use crate::core::key::Key;
use crate::core::{CoreError, CoreResult};
use crate::manifold::{Manifold, Rn, SE3, SO3};

/// A manifold-typed value stored in a [`Values`] container.
///
/// Tagged variants over the supported manifold types; dispatch is a plain
/// match, which keeps factor-local hot paths inlineable.
#[derive(Debug, Clone)]
pub enum ManifoldValue {
    /// Euclidean vector
    Rn(Rn),
    /// 3D rotation
    SO3(SO3),
    /// Rigid-body transformation
    SE3(SE3),
}

impl ManifoldValue {
    /// Number of scalars in the packed representation.
    pub fn storage_dim(&self) -> usize {
        match self {
            ManifoldValue::Rn(v) => v.storage_dim(),
            ManifoldValue::SO3(v) => v.storage_dim(),
            ManifoldValue::SE3(v) => v.storage_dim(),
        }
    }

    /// Dimension of the local tangent-space parameterization.
    pub fn tangent_dim(&self) -> usize {
        match self {
            ManifoldValue::Rn(v) => v.tangent_dim(),
            ManifoldValue::SO3(v) => v.tangent_dim(),
            ManifoldValue::SE3(v) => v.tangent_dim(),
        }
    }

    /// Serialize into a packed storage vector.
    pub fn to_storage(&self) -> DVector<f64> {
        match self {
            ManifoldValue::Rn(v) => v.to_storage(),
            ManifoldValue::SO3(v) => v.to_storage(),
            ManifoldValue::SE3(v) => v.to_storage(),
        }
    }

    /// Apply a tangent-space increment through the type's retraction.
    pub fn retract(&self, delta: &[f64], epsilon: f64) -> CoreResult<Self> {
        let retracted = match self {
            ManifoldValue::Rn(v) => ManifoldValue::Rn(v.retract(delta, epsilon)?),
            ManifoldValue::SO3(v) => ManifoldValue::SO3(v.retract(delta, epsilon)?),
            ManifoldValue::SE3(v) => ManifoldValue::SE3(v.retract(delta, epsilon)?),
        };
        Ok(retracted)
    }

    /// Tangent vector taking `self` to `other`; errors on mixed types.
    pub fn local_coordinates(&self, other: &Self, epsilon: f64) -> CoreResult<DVector<f64>> {
        match (self, other) {
            (ManifoldValue::Rn(a), ManifoldValue::Rn(b)) => Ok(a.local_coordinates(b, epsilon)),
            (ManifoldValue::SO3(a), ManifoldValue::SO3(b)) => Ok(a.local_coordinates(b, epsilon)),
            (ManifoldValue::SE3(a), ManifoldValue::SE3(b)) => Ok(a.local_coordinates(b, epsilon)),
            (a, b) => Err(CoreError::TypeMismatch {
                expected: a.type_name(),
                found: b.type_name(),
            }),
        }
    }

    /// Human-readable name of the stored type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ManifoldValue::Rn(_) => "Rn",
            ManifoldValue::SO3(_) => "SO3",
            ManifoldValue::SE3(_) => "SE3",
        }
    }
}

impl From<Rn> for ManifoldValue {
    fn from(value: Rn) -> Self {
        ManifoldValue::Rn(value)
    }
}

impl From<SO3> for ManifoldValue {
    fn from(value: SO3) -> Self {
        ManifoldValue::SO3(value)
    }
}

impl From<SE3> for ManifoldValue {
    fn from(value: SE3) -> Self {
        ManifoldValue::SE3(value)
    }
}

/// Typed extraction from a [`ManifoldValue`], used by [`Values::get`].
pub trait ManifoldEntry: Sized + Clone + Into<ManifoldValue> {
    /// Borrow the concrete type out of the enum, if the variant matches.
    fn from_value(value: &ManifoldValue) -> Option<&Self>;
    /// Name used in type-mismatch errors.
    fn entry_type_name() -> &'static str;
}

impl ManifoldEntry for Rn {
    fn from_value(value: &ManifoldValue) -> Option<&Self> {
        match value {
            ManifoldValue::Rn(v) => Some(v),
            _ => None,
        }
    }

    fn entry_type_name() -> &'static str {
        "Rn"
    }
}

impl ManifoldEntry for SO3 {
    fn from_value(value: &ManifoldValue) -> Option<&Self> {
        match value {
            ManifoldValue::SO3(v) => Some(v),
            _ => None,
        }
    }

    fn entry_type_name() -> &'static str {
        "SO3"
    }
}

impl ManifoldEntry for SE3 {
    fn from_value(value: &ManifoldValue) -> Option<&Self> {
        match value {
            ManifoldValue::SE3(v) => Some(v),
            _ => None,
        }
    }

    fn entry_type_name() -> &'static str {
        "SE3"
    }
}

/// One row of a [`ValuesIndex`]: where a key's data lives inside the
/// concatenated storage and tangent vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub storage_offset: usize,
    pub storage_dim: usize,
    pub tangent_offset: usize,
    pub tangent_dim: usize,
}

/// Immutable offset table over an ordered subset of keys.
#[derive(Debug, Clone, Default)]
pub struct ValuesIndex {
    entries: Vec<IndexEntry>,
    storage_dim: usize,
    tangent_dim: usize,
}

impl ValuesIndex {
    /// The indexed entries, in key-list order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Total storage dimension of the indexed keys.
    pub fn storage_dim(&self) -> usize {
        self.storage_dim
    }

    /// Total tangent dimension of the indexed keys.
    pub fn tangent_dim(&self) -> usize {
        self.tangent_dim
    }

    /// Look up the entry for a key, if indexed.
    pub fn entry(&self, key: Key) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

/// Mapping from [`Key`] to manifold-typed values with deterministic
/// iteration order.
#[derive(Debug, Clone, Default)]
pub struct Values {
    map: HashMap<Key, ManifoldValue>,
    order: Vec<Key>,
}

impl Values {
    /// Create an empty container.
    pub fn new() -> Self {
        Values {
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Insert or overwrite the value at `key`.
    pub fn set<T: Into<ManifoldValue>>(&mut self, key: Key, value: T) {
        if self.map.insert(key, value.into()).is_none() {
            self.order.push(key);
        }
    }

    /// Whether `key` has an entry.
    pub fn has(&self, key: Key) -> bool {
        self.map.contains_key(&key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.order.iter().copied()
    }

    /// Typed borrow of the value at `key`.
    ///
    /// Fails if the key is absent or the stored type does not match `T`.
    pub fn get<T: ManifoldEntry>(&self, key: Key) -> CoreResult<&T> {
        let value = self.map.get(&key).ok_or(CoreError::UnknownKey(key))?;
        T::from_value(value).ok_or_else(|| CoreError::TypeMismatch {
            expected: T::entry_type_name(),
            found: value.type_name(),
        })
    }

    /// Untyped borrow of the value at `key`.
    pub fn get_value(&self, key: Key) -> CoreResult<&ManifoldValue> {
        self.map.get(&key).ok_or(CoreError::UnknownKey(key))
    }

    /// Packed storage vector of the value at `key`.
    pub fn storage(&self, key: Key) -> CoreResult<DVector<f64>> {
        Ok(self.get_value(key)?.to_storage())
    }

    /// Build an offset table over `keys`, in the given order.
    ///
    /// Fails if any key is absent: a factor or optimizer referencing a key
    /// that is not in the values is a configuration error.
    pub fn create_index(&self, keys: &[Key]) -> CoreResult<ValuesIndex> {
        let mut entries = Vec::with_capacity(keys.len());
        let mut storage_offset = 0;
        let mut tangent_offset = 0;
        for &key in keys {
            let value = self.get_value(key)?;
            let storage_dim = value.storage_dim();
            let tangent_dim = value.tangent_dim();
            entries.push(IndexEntry {
                key,
                storage_offset,
                storage_dim,
                tangent_offset,
                tangent_dim,
            });
            storage_offset += storage_dim;
            tangent_offset += tangent_dim;
        }
        Ok(ValuesIndex {
            entries,
            storage_dim: storage_offset,
            tangent_dim: tangent_offset,
        })
    }

    /// Apply a tangent-space increment `dx` to the indexed keys, key by
    /// key, through each type's retraction.
    ///
    /// `dx` must have length `index.tangent_dim()`.
    pub fn retract(&mut self, index: &ValuesIndex, dx: &[f64], epsilon: f64) -> CoreResult<()> {
        if dx.len() != index.tangent_dim() {
            return Err(CoreError::DimensionMismatch {
                what: "tangent increment",
                expected: index.tangent_dim(),
                actual: dx.len(),
            });
        }
        for entry in index.entries() {
            let value = self
                .map
                .get(&entry.key)
                .ok_or(CoreError::UnknownKey(entry.key))?;
            let segment = &dx[entry.tangent_offset..entry.tangent_offset + entry.tangent_dim];
            let retracted = value.retract(segment, epsilon)?;
            self.map.insert(entry.key, retracted);
        }
        Ok(())
    }

    /// Copy the values listed in `index_b` from `other` into `self` at the
    /// corresponding positions of `index_a`.
    ///
    /// The two indices must list the same number of entries with matching
    /// dimensions. Used by the optimizer to save and restore the
    /// best-seen state without reallocating.
    pub fn update(
        &mut self,
        index_a: &ValuesIndex,
        index_b: &ValuesIndex,
        other: &Values,
    ) -> CoreResult<()> {
        if index_a.entries().len() != index_b.entries().len() {
            return Err(CoreError::DimensionMismatch {
                what: "index entry count",
                expected: index_a.entries().len(),
                actual: index_b.entries().len(),
            });
        }
        for (entry_a, entry_b) in index_a.entries().iter().zip(index_b.entries()) {
            if entry_a.storage_dim != entry_b.storage_dim {
                return Err(CoreError::DimensionMismatch {
                    what: "storage dimension",
                    expected: entry_a.storage_dim,
                    actual: entry_b.storage_dim,
                });
            }
            let value = other.get_value(entry_b.key)?.clone();
            if self.map.insert(entry_a.key, value).is_none() {
                self.order.push(entry_a.key);
            }
        }
        Ok(())
    }
}
