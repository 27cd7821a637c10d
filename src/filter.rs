//! Structural tree edit: remove items matching a predicate while keeping
//! every `choose_args` overlay consistent.
//!
//! Removing a bucket also removes its subtree and, transitively, any
//! overlay entries that named an id now gone from the tree. The edit is
//! done in merged form (each bucket carries its own overlay entries) so
//! that deleting a bucket can't leave a dangling split-form entry behind;
//! [`crate::overlay::split`] restores canonical storage afterward.

use crate::types::{CrushMap, Item};
use std::collections::HashSet;

/// Remove every item (device or bucket, recursively) for which `predicate`
/// returns `true`, and scrub `choose_args` overlays of any id/weight_set
/// position that referenced a removed item.
pub fn remove_where(map: &mut CrushMap, predicate: impl Fn(&Item) -> bool) {
    let names: Vec<String> = map.choose_args.keys().cloned().collect();
    for name in &names {
        crate::overlay::merge(map, name);
    }

    let mut removed_ids = HashSet::new();
    map.trees = map
        .trees
        .drain(..)
        .filter_map(|item| prune(item, &predicate, &mut removed_ids))
        .collect();

    for name in &names {
        crate::overlay::split(map, name);
        // An overlay that existed before this edit must keep existing even
        // if every bucket it touched was removed, so external references to
        // the name by callers stay valid.
        map.choose_args.entry(name.clone()).or_insert_with(Vec::new);
    }

    for entries in map.choose_args.values_mut() {
        entries.retain(|e| !removed_ids.contains(&e.bucket_id));
        for entry in entries.iter_mut() {
            scrub_entry(entry, &removed_ids);
        }
    }
}

fn prune(item: Item, predicate: &impl Fn(&Item) -> bool, removed: &mut HashSet<i32>) -> Option<Item> {
    if predicate(&item) {
        collect_ids(&item, removed);
        return None;
    }
    match item {
        Item::Device(_) => Some(item),
        Item::Bucket(mut b) => {
            b.children = b
                .children
                .drain(..)
                .filter_map(|c| prune(c, predicate, removed))
                .collect();
            Some(Item::Bucket(b))
        }
    }
}

fn collect_ids(item: &Item, removed: &mut HashSet<i32>) {
    removed.insert(item.id());
    if let Item::Bucket(b) = item {
        for c in &b.children {
            collect_ids(c, removed);
        }
    }
}

fn scrub_entry(entry: &mut crate::types::ChooseArgsEntry, removed: &HashSet<i32>) {
    if let Some(ids) = &entry.ids {
        if ids.iter().any(|id| removed.contains(id)) {
            let keep: Vec<usize> = ids
                .iter()
                .enumerate()
                .filter(|(_, id)| !removed.contains(id))
                .map(|(i, _)| i)
                .collect();
            entry.ids = Some(keep.iter().map(|&i| ids[i]).collect());
            if let Some(rows) = &mut entry.weight_set {
                for row in rows.iter_mut() {
                    *row = keep.iter().filter_map(|&i| row.get(i).copied()).collect();
                }
            }
        }
    }
}

/// Remove a single named bucket's subtree entirely.
pub fn remove_bucket(map: &mut CrushMap, name: &str) {
    remove_where(map, |item| item.name() == name);
}
