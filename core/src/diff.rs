use std::collections::BTreeSet;

use crate::{config::ReplaceStrategy, snapshot::Snapshot};

/// Positional change sets between two snapshots. `deleted` indexes the old snapshot, `inserted` and
/// `modified` index the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    pub deleted: BTreeSet<usize>,
    pub inserted: BTreeSet<usize>,
    pub modified: BTreeSet<usize>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool { self.deleted.is_empty() && self.inserted.is_empty() && self.modified.is_empty() }

    pub fn len(&self) -> usize { self.deleted.len() + self.inserted.len() + self.modified.len() }
}

/// Computes a replacement diff from `old` to `new`.
///
/// Equal snapshots yield an empty diff. Otherwise the result only ever deletes and inserts; applying
/// all deletes (against `old`) and then all inserts (against the result) reproduces `new` exactly.
/// `modified` is always empty since positions are not matched across the two snapshots.
pub fn diff<T: PartialEq>(old: &Snapshot<T>, new: &Snapshot<T>, strategy: ReplaceStrategy) -> IndexDiff {
    if old == new {
        return IndexDiff::default();
    }

    let (prefix, suffix) = match strategy {
        ReplaceStrategy::Full => (0, 0),
        ReplaceStrategy::TrimCommonEnds => common_ends(old.as_slice(), new.as_slice()),
    };

    IndexDiff {
        deleted: (prefix..old.len() - suffix).collect(),
        inserted: (prefix..new.len() - suffix).collect(),
        modified: BTreeSet::new(),
    }
}

/// Length of the common prefix, then of the common suffix of what the prefix leaves. The two never overlap.
fn common_ends<T: PartialEq>(old: &[T], new: &[T]) -> (usize, usize) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let (old_rest, new_rest) = (&old[prefix..], &new[prefix..]);
    let suffix = old_rest.iter().rev().zip(new_rest.iter().rev()).take_while(|(a, b)| a == b).count();
    (prefix, suffix)
}
