use std::ops::{Deref, Index};
use std::sync::Arc;

/// An element of a live collection. Identity for reconciliation is position plus value equality;
/// items need not carry a stable key.
pub trait Item: PartialEq + Send + Sync + 'static {}

impl<T: PartialEq + Send + Sync + 'static> Item for T {}

/// An immutable, ordered view of a collection captured at one instant.
///
/// Snapshots are cheap to clone and never share mutable state with the collection they were taken
/// from. Two snapshots are equal when they have the same length and element-wise equal items in the
/// same order.
pub struct Snapshot<T>(Arc<[T]>);

impl<T> Snapshot<T> {
    pub fn empty() -> Self { Self(Arc::from(Vec::new())) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn get(&self, index: usize) -> Option<&T> { self.0.get(index) }

    pub fn iter(&self) -> std::slice::Iter<'_, T> { self.0.iter() }

    pub fn as_slice(&self) -> &[T] { &self.0 }

    /// True when both snapshots share the same backing allocation
    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl<T: Clone> Snapshot<T> {
    pub fn to_vec(&self) -> Vec<T> { self.0.to_vec() }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self { Self::empty() }
}

impl<T: PartialEq> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool { self.ptr_eq(other) || self.0[..] == other.0[..] }
}

impl<T: Eq> Eq for Snapshot<T> {}

impl<T: PartialEq> PartialEq<[T]> for Snapshot<T> {
    fn eq(&self, other: &[T]) -> bool { self.0[..] == *other }
}

impl<T: PartialEq, const N: usize> PartialEq<[T; N]> for Snapshot<T> {
    fn eq(&self, other: &[T; N]) -> bool { self.0[..] == other[..] }
}

impl<T: PartialEq> PartialEq<Vec<T>> for Snapshot<T> {
    fn eq(&self, other: &Vec<T>) -> bool { self.0[..] == other[..] }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_list().entries(self.0.iter()).finish() }
}

impl<T> Deref for Snapshot<T> {
    type Target = [T];
    fn deref(&self) -> &[T] { &self.0 }
}

impl<T> Index<usize> for Snapshot<T> {
    type Output = T;
    fn index(&self, index: usize) -> &T { &self.0[index] }
}

impl<T> From<Vec<T>> for Snapshot<T> {
    fn from(items: Vec<T>) -> Self { Self(Arc::from(items)) }
}

impl<T: Clone> From<&[T]> for Snapshot<T> {
    fn from(items: &[T]) -> Self { Self(Arc::from(items)) }
}

impl<T, const N: usize> From<[T; N]> for Snapshot<T> {
    fn from(items: [T; N]) -> Self { Self(Arc::from(Vec::from(items))) }
}

impl<T> FromIterator<T> for Snapshot<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}
