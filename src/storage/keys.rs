use std::fmt;

use bincode::{Decode, Encode};

/// Identifies a row inside a table.
///
/// Only the low 63 bits carry meaning. Non-negative values are regular
/// keys, `-1` is the null key and anything `<= -2` is an unresolved key: a
/// placeholder for a link target that has not been created yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct ObjectKey(i64);

impl ObjectKey {
    pub const NULL: ObjectKey = ObjectKey(-1);

    /// Largest regular key. Its unresolved image is [`ObjectKey::MIN`], the
    /// smallest value that fits in 63 bits.
    pub const MAX: i64 = (1 << 62) - 2;
    pub const MIN: i64 = -(1 << 62);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        (0..=Self::MAX).contains(&self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == -1
    }

    pub fn is_unresolved(&self) -> bool {
        (Self::MIN..=-2).contains(&self.0)
    }

    /// Whether the key may be stored in a cluster tree.
    pub fn is_storable(&self) -> bool {
        self.is_valid() || self.is_unresolved()
    }

    /// Maps a valid key onto its unresolved counterpart (`k -> -2 - k`).
    pub fn to_unresolved(&self) -> Option<ObjectKey> {
        self.is_valid().then(|| ObjectKey(-2 - self.0))
    }

    /// Inverse of [`ObjectKey::to_unresolved`].
    pub fn resolve(&self) -> Option<ObjectKey> {
        self.is_unresolved().then(|| ObjectKey(-2 - self.0))
    }
}

impl From<i64> for ObjectKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifies a table. Assigned once and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct TableKey(u32);

impl TableKey {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    pub(crate) fn next(&self) -> TableKey {
        TableKey(self.0 + 1)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_classes() {
        assert!(ObjectKey::new(0).is_valid());
        assert!(ObjectKey::new(ObjectKey::MAX).is_valid());
        assert!(!ObjectKey::new(ObjectKey::MAX + 1).is_valid());
        assert!(ObjectKey::NULL.is_null());
        assert!(!ObjectKey::NULL.is_unresolved());
        assert!(ObjectKey::new(-2).is_unresolved());
        assert!(ObjectKey::new(ObjectKey::MIN).is_unresolved());
        assert!(!ObjectKey::new(ObjectKey::MIN - 1).is_unresolved());
    }

    #[test]
    fn out_of_range_keys_are_not_storable() {
        assert!(ObjectKey::new(0).is_storable());
        assert!(ObjectKey::new(-7).is_storable());
        assert!(!ObjectKey::NULL.is_storable());
        assert!(!ObjectKey::new(i64::MAX).is_storable());
        assert!(!ObjectKey::new(ObjectKey::MAX + 1).is_storable());
        assert!(!ObjectKey::new(i64::MIN).is_storable());
    }

    #[test]
    fn range_ends_map_onto_each_other() {
        let top = ObjectKey::new(ObjectKey::MAX);
        let tombstone = top.to_unresolved().unwrap();
        assert_eq!(tombstone, ObjectKey::new(ObjectKey::MIN));
        assert_eq!(tombstone.resolve(), Some(top));

        assert_eq!(ObjectKey::new(ObjectKey::MAX + 1).to_unresolved(), None);
    }

    #[test]
    fn unresolved_round_trip() {
        let key = ObjectKey::new(41);
        let tombstone = key.to_unresolved().unwrap();

        assert_eq!(tombstone, ObjectKey::new(-43));
        assert_eq!(tombstone.resolve(), Some(key));
        assert_eq!(ObjectKey::NULL.to_unresolved(), None);
        assert_eq!(key.resolve(), None);
    }

    #[test]
    fn keys_order_numerically() {
        let mut keys = vec![ObjectKey::new(5), ObjectKey::new(-3), ObjectKey::new(1)];
        keys.sort();
        assert_eq!(
            keys,
            vec![ObjectKey::new(-3), ObjectKey::new(1), ObjectKey::new(5)]
        );
    }

    #[test]
    fn display() {
        assert_eq!(ObjectKey::NULL.to_string(), "null");
        assert_eq!(ObjectKey::new(7).to_string(), "7");
        assert_eq!(TableKey::new(3).to_string(), "t3");
    }
}
