//! Insertion-ordered set.
//!
//! Append-if-absent over a map from value to first-seen position. Used to
//! build response lists where the primary's own values must come first.

use std::collections::HashMap;
use std::hash::Hash;

/// A set that remembers the order in which values were first inserted.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    positions: HashMap<T, usize>,
    items: Vec<T>,
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            items: Vec::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> OrderedSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` unless already present. Returns true if it was added.
    pub fn insert(&mut self, value: T) -> bool {
        if self.positions.contains_key(&value) {
            return false;
        }
        self.positions.insert(value.clone(), self.items.len());
        self.items.push(value);
        true
    }

    /// Consumes the set, returning values in first-seen order.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T: Clone + Eq + Hash> Extend<T> for OrderedSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.insert(value);
        }
    }
}

impl<T: Clone + Eq + Hash> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
