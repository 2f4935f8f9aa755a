//! # Instance identities.
//!
//! An [`Identity`] is a small non-negative integer naming one instance and its
//! configuration scope. The [`IdentitySet`] is the ordered set of identities the
//! supervisor knows about; it is persisted so identities survive restarts and can be
//! reused after an instance closes.
//!
//! ## Rules
//! - Allocation scans upward from zero: [`IdentitySet::next_free`] returns the smallest
//!   value not in the set.
//! - The persisted form is a JSON array of integers in ascending order; entries that are
//!   not valid identities are skipped on load.

use std::collections::BTreeSet;

use serde_json::Value;

/// Stable numeric name of an instance.
pub type Identity = u32;

/// Ordered set of known identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySet {
    ids: BTreeSet<Identity>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest non-negative identity not currently in the set.
    ///
    /// # Example
    /// ```
    /// use livevisor::IdentitySet;
    ///
    /// let mut set = IdentitySet::new();
    /// set.insert(0);
    /// set.insert(2);
    /// assert_eq!(set.next_free(), 1);
    /// ```
    pub fn next_free(&self) -> Identity {
        let mut candidate: Identity = 0;
        for &id in &self.ids {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    /// Returns `true` if the identity was newly inserted.
    pub fn insert(&mut self, id: Identity) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: Identity) -> bool {
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: Identity) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ascending iteration.
    pub fn iter(&self) -> impl Iterator<Item = Identity> + '_ {
        self.ids.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<Identity> {
        self.iter().collect()
    }

    /// Persisted representation (JSON array, ascending).
    pub fn to_value(&self) -> Value {
        Value::Array(self.ids.iter().map(|&id| Value::from(id)).collect())
    }

    /// Parses the persisted representation, skipping anything that is not a valid identity.
    ///
    /// Integers may also arrive as strings (hand-edited documents).
    pub fn from_value(value: &Value) -> Self {
        let ids = value
            .as_array()
            .map(|items| items.iter().filter_map(parse_identity).collect())
            .unwrap_or_default();
        Self { ids }
    }
}

impl FromIterator<Identity> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

fn parse_identity(v: &Value) -> Option<Identity> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| Identity::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_free_on_empty_is_zero() {
        assert_eq!(IdentitySet::new().next_free(), 0);
    }

    #[test]
    fn test_next_free_fills_gaps_first() {
        let mut set: IdentitySet = [0, 1, 3, 4].into_iter().collect();
        assert_eq!(set.next_free(), 2);
        set.insert(2);
        assert_eq!(set.next_free(), 5);
        set.remove(0);
        assert_eq!(set.next_free(), 0);
    }

    #[test]
    fn test_next_free_is_smallest_missing_for_any_sequence() {
        let mut set = IdentitySet::new();
        let ops: [(bool, Identity); 10] = [
            (true, 0),
            (true, 1),
            (true, 2),
            (false, 1),
            (true, 5),
            (false, 0),
            (true, 0),
            (true, 1),
            (false, 2),
            (true, 3),
        ];
        for (add, id) in ops {
            if add {
                set.insert(id);
            } else {
                set.remove(id);
            }
            let expected = (0..).find(|i| !set.contains(*i)).unwrap();
            assert_eq!(set.next_free(), expected, "after {:?}", set.to_vec());
        }
    }

    #[test]
    fn test_value_roundtrip_is_ordered() {
        let set: IdentitySet = [3, 0, 7].into_iter().collect();
        assert_eq!(set.to_value(), json!([0, 3, 7]));
        assert_eq!(IdentitySet::from_value(&set.to_value()), set);
    }

    #[test]
    fn test_from_value_skips_garbage() {
        let set = IdentitySet::from_value(&json!([1, "2", -4, "x", null, 1.5, 1]));
        assert_eq!(set.to_vec(), vec![1, 2]);
        assert!(IdentitySet::from_value(&json!({"a": 1})).is_empty());
    }
}
