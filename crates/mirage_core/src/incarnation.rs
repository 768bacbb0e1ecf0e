//! Incarnation counters
//!
//! An [`Incarnation`] is a version stamp that only ever moves forward. Scene
//! nodes carry several of them (own, tree, bounding volume, ...) and cache
//! entries keep snapshots; an entry is in sync with its source when every
//! snapshot equals the live counter.

use std::fmt;

/// Monotonically increasing version stamp.
///
/// There is no decrement and no arithmetic besides [`Incarnation::increment`].
/// Two incarnations are "in sync" iff they are numerically equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Incarnation {
    value: u64,
}

impl Incarnation {
    #[must_use]
    pub const fn new() -> Self {
        Self { value: 0 }
    }

    /// Advances the counter by one.
    #[inline]
    pub fn increment(&mut self) {
        self.value += 1;
    }

    /// Returns `true` when `snapshot` was taken from this counter and nothing
    /// changed since.
    #[inline]
    #[must_use]
    pub fn equals(&self, snapshot: &Incarnation) -> bool {
        self.value == snapshot.value
    }

    /// Raw counter value, for logging and diagnostics.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.value)
    }
}

/// Mutable guard that bumps an incarnation when the edit scope ends.
///
/// ```rust,ignore
/// if let Some(mut params) = scene.edit_material(material) {
///     params.roughness = 0.2;
/// } // own incarnation of `material` advances here
/// ```
pub struct IncarnationGuard<'a, T> {
    data: &'a mut T,
    incarnation: &'a mut Incarnation,
}

impl<'a, T> IncarnationGuard<'a, T> {
    pub fn new(data: &'a mut T, incarnation: &'a mut Incarnation) -> Self {
        Self { data, incarnation }
    }
}

impl<T> std::ops::Deref for IncarnationGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> std::ops::DerefMut for IncarnationGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for IncarnationGuard<'_, T> {
    fn drop(&mut self) {
        self.incarnation.increment();
    }
}
