//! Hierarchical grouping of cards by collection path, and request batching.
//!
//! Priorities are assigned relative to the other cards in the same request, so a
//! group needs enough members for the model to calibrate against. Leaf paths that
//! are too small are folded into the nearest ancestor path that holds cards of its
//! own; everything else keeps its most specific path.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::ItemId;

/// Segment delimiter of collection paths ("Bio::Cells::Membranes").
pub const PATH_DELIMITER: &str = "::";

/// Default minimum number of cards a non-top-level group must hold.
pub const DEFAULT_MIN_CONTEXT_SIZE: usize = 10;

/// Default number of cards per provider request.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Number of delimiters in `path`; top-level paths have depth 0.
pub fn path_depth(path: &str) -> usize {
    path.matches(PATH_DELIMITER).count()
}

/// The path with its last segment removed, or `None` for a top-level path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind(PATH_DELIMITER).map(|idx| &path[..idx])
}

/// A final group: a collection path and the cards assigned to it, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub key: String,
    pub item_ids: Vec<ItemId>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// Partition `(id, path)` pairs into context groups.
///
/// Buckets are visited most-nested first (ties broken by path) so that children are
/// merged before their ancestors decide whether they are big enough themselves. A
/// bucket is kept when it has at least `min_context_size` cards or is top-level;
/// otherwise its cards move into the nearest ancestor that exists as a bucket, and
/// that ancestor's later decision sees the enlarged size. A bucket with no ancestor
/// bucket at all is kept as-is.
///
/// Groups come back in the order they were finalized.
pub fn group_by_hierarchy(items: &[(ItemId, String)], min_context_size: usize) -> Vec<Group> {
    let mut buckets: HashMap<&str, Vec<ItemId>> = HashMap::new();
    for (id, path) in items {
        buckets.entry(path.as_str()).or_default().push(*id);
    }

    let mut order: Vec<&str> = buckets.keys().copied().collect();
    order.sort_by(|a, b| path_depth(b).cmp(&path_depth(a)).then_with(|| a.cmp(b)));

    let mut groups = Vec::new();
    for key in order {
        let ids = buckets.remove(key).unwrap_or_default();

        if ids.len() >= min_context_size || path_depth(key) == 0 {
            groups.push(Group {
                key: key.to_string(),
                item_ids: ids,
            });
            continue;
        }

        let mut ancestor = parent_path(key);
        while let Some(candidate) = ancestor {
            if buckets.contains_key(candidate) {
                break;
            }
            ancestor = parent_path(candidate);
        }

        match ancestor.and_then(|a| buckets.get_mut(a)) {
            Some(target) => {
                tracing::debug!(
                    from = key,
                    into = ancestor.unwrap_or_default(),
                    cards = ids.len(),
                    "merging undersized group into ancestor"
                );
                target.extend(ids);
            }
            None => groups.push(Group {
                key: key.to_string(),
                item_ids: ids,
            }),
        }
    }

    groups
}

/// Accumulates items and hands out full batches of at most `size` items.
#[derive(Debug)]
pub struct Batcher<T> {
    size: usize,
    pending: Vec<T>,
}

impl<T> Batcher<T> {
    /// `size` of zero is treated as one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            pending: Vec::with_capacity(size),
        }
    }

    /// Add an item; returns the batch once it reaches the configured size.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.pending.push(item);
        if self.pending.len() >= self.size {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.size),
            ))
        } else {
            None
        }
    }

    /// Take the trailing partial batch, if any.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Split `items` into consecutive batches of at most `size`, preserving order.
pub fn batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    let mut batcher = Batcher::new(size);
    let mut out: Vec<Vec<T>> = items
        .iter()
        .cloned()
        .filter_map(|item| batcher.push(item))
        .collect();
    out.extend(batcher.flush());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(path: &str, ids: std::ops::Range<i64>) -> Vec<(ItemId, String)> {
        ids.map(|id| (id, path.to_string())).collect()
    }

    #[test]
    fn depth_and_parent() {
        assert_eq!(path_depth("Bio"), 0);
        assert_eq!(path_depth("Bio::Cells::Membranes"), 2);
        assert_eq!(parent_path("Bio::Cells::Membranes"), Some("Bio::Cells"));
        assert_eq!(parent_path("Bio"), None);
    }

    #[test]
    fn large_leaf_without_ancestor_bucket_is_kept() {
        let groups = group_by_hierarchy(&items("Bio::Cells", 0..25), 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Bio::Cells");
        assert_eq!(groups[0].len(), 25);
    }

    #[test]
    fn small_leaf_merges_into_parent_bucket() {
        let mut input = items("Bio::Cells", 0..3);
        input.extend(items("Bio", 100..108));
        let groups = group_by_hierarchy(&input, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Bio");
        assert_eq!(groups[0].len(), 11);
        // Parent's own cards first, merged children appended.
        let own: Vec<ItemId> = (100..108).collect();
        assert_eq!(&groups[0].item_ids[..8], own.as_slice());
        assert_eq!(&groups[0].item_ids[8..], &[0, 1, 2]);
    }

    #[test]
    fn small_leaf_without_any_ancestor_bucket_stays() {
        let groups = group_by_hierarchy(&items("Bio::Cells::Membranes", 0..2), 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Bio::Cells::Membranes");
    }

    #[test]
    fn merge_skips_missing_intermediate_levels() {
        let mut input = items("Bio::Cells::Membranes", 0..2);
        input.extend(items("Bio", 10..12));
        let groups = group_by_hierarchy(&input, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Bio");
        assert_eq!(groups[0].len(), 4);
    }

    #[test]
    fn top_level_groups_are_kept_even_when_small() {
        let mut input = items("Chem", 0..2);
        input.extend(items("Bio", 10..11));
        let groups = group_by_hierarchy(&input, 10);
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["Bio", "Chem"]);
    }

    #[test]
    fn batcher_emits_full_batches_then_tail() {
        let mut b = Batcher::new(3);
        assert!(b.push(1).is_none());
        assert!(b.push(2).is_none());
        assert_eq!(b.push(3), Some(vec![1, 2, 3]));
        assert!(b.push(4).is_none());
        assert_eq!(b.pending_len(), 1);
        assert_eq!(b.flush(), Some(vec![4]));
        assert_eq!(b.flush(), None);
    }

    #[test]
    fn twenty_three_items_make_three_batches() {
        let ids: Vec<i64> = (0..23).collect();
        let sizes: Vec<usize> = batches(&ids, 10).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        assert_eq!(batches(&[1, 2], 0), vec![vec![1], vec![2]]);
        assert!(batches::<i64>(&[], 10).is_empty());
    }
}
