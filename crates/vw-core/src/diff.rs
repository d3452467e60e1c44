//! Set differences between consecutive observations.

use std::collections::BTreeSet;

use serde::Serialize;

/// What changed between a previous and a current set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetDiff<T: Ord> {
    /// In current but not previous.
    pub inserted: BTreeSet<T>,
    /// In previous but not current.
    pub removed: BTreeSet<T>,
}

impl<T: Ord + Clone> SetDiff<T> {
    pub fn between(previous: &BTreeSet<T>, current: &BTreeSet<T>) -> Self {
        SetDiff {
            inserted: current.difference(previous).cloned().collect(),
            removed: previous.difference(current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }

    /// Replay the diff on `base`.
    pub fn apply(&self, base: &BTreeSet<T>) -> BTreeSet<T> {
        base.difference(&self.removed)
            .chain(self.inserted.iter())
            .cloned()
            .collect()
    }
}

impl<T: Ord> Default for SetDiff<T> {
    fn default() -> Self {
        SetDiff {
            inserted: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_observation_diffs_against_empty() {
        let diff = SetDiff::between(&BTreeSet::new(), &set(&["a", "b"]));
        assert_eq!(diff.inserted, set(&["a", "b"]));
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_replacement() {
        let diff = SetDiff::between(&set(&["a", "b"]), &set(&["a", "c"]));
        assert_eq!(diff.inserted, set(&["c"]));
        assert_eq!(diff.removed, set(&["b"]));
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_unchanged_is_empty() {
        let diff = SetDiff::between(&set(&["a"]), &set(&["a"]));
        assert!(diff.is_empty());
        assert_eq!(diff, SetDiff::default());
    }

    proptest! {
        #[test]
        fn prop_diff_replays_exactly(
            a in prop::collection::btree_set(0u32..64, 0..32),
            b in prop::collection::btree_set(0u32..64, 0..32),
        ) {
            let diff = SetDiff::between(&a, &b);
            prop_assert_eq!(diff.apply(&a), b.clone());
            prop_assert!(diff.inserted.is_disjoint(&a));
            prop_assert!(diff.removed.is_subset(&a));
            prop_assert!(diff.removed.is_disjoint(&b));
            prop_assert_eq!(diff.is_empty(), a == b);
        }
    }
}
