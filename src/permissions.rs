use crate::directory::Directory;
use crate::model::Grant;
use std::collections::{BTreeMap, BTreeSet};

/// Grants to add and remove so that `current` becomes `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantDiff {
    pub insert: BTreeSet<Grant>,
    pub delete: BTreeSet<Grant>,
}

impl GrantDiff {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.delete.is_empty()
    }
}

pub fn diff_grants(current: &BTreeSet<Grant>, desired: &BTreeSet<Grant>) -> GrantDiff {
    GrantDiff {
        insert: desired.difference(current).copied().collect(),
        delete: current.difference(desired).copied().collect(),
    }
}

/// Makes the user's stored grants equal `desired` (client name -> model names).
///
/// Name resolution happens first; an unknown client or model aborts before
/// anything is written. The write itself is all-or-nothing.
pub fn sync_permissions(
    directory: &dyn Directory,
    user_id: u64,
    desired: &BTreeMap<String, Vec<String>>,
) -> anyhow::Result<GrantDiff> {
    let desired = directory.resolve_grants(desired)?;
    let diff = directory.reconcile_grants(user_id, &desired)?;
    tracing::info!(
        user_id,
        inserted = diff.insert.len(),
        deleted = diff.delete.len(),
        "permissions synced"
    );
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(client_id: u64, model_id: u64) -> Grant {
        Grant { client_id, model_id }
    }

    #[test]
    fn diff_is_set_difference_both_ways() {
        let current: BTreeSet<_> = [g(1, 1), g(1, 2), g(2, 5)].into();
        let desired: BTreeSet<_> = [g(1, 2), g(2, 5), g(3, 9)].into();
        let d = diff_grants(&current, &desired);
        assert_eq!(d.insert, [g(3, 9)].into());
        assert_eq!(d.delete, [g(1, 1)].into());
    }

    #[test]
    fn identical_sets_produce_empty_diff() {
        let set: BTreeSet<_> = [g(1, 1)].into();
        assert!(diff_grants(&set, &set).is_empty());
        assert!(diff_grants(&BTreeSet::new(), &BTreeSet::new()).is_empty());
    }
}
