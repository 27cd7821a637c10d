//! Merge/split of `choose_args` overlays.
//!
//! `CrushMap::choose_args` holds the canonical *split form*: one overlay
//! name maps to a flat `Vec<ChooseArgsEntry>` sorted by bucket id. Editing
//! code (the optimizer, the filter) wants the *merged form* instead: each
//! bucket carries its own entry inline, keyed by overlay name, so a bucket
//! rewrite and its overlay travel together. `merge` and `split` are mutual
//! inverses — `split(merge(map, name), name) == map.choose_args[name]`
//! (up to bucket-id sort order), which is exercised below.

use crate::types::{ChooseArgsEntry, CrushMap, Item};

/// Copy the named overlay's entries onto their buckets' `choose_args` map,
/// consuming the split-form storage for that name. Buckets with no entry
/// in the overlay are left untouched.
pub fn merge(map: &mut CrushMap, name: &str) {
    let entries = match map.choose_args.remove(name) {
        Some(entries) => entries,
        None => return,
    };
    for entry in entries {
        attach(&mut map.trees, name, entry);
    }
}

fn attach(items: &mut [Item], name: &str, entry: ChooseArgsEntry) {
    for item in items.iter_mut() {
        if let Item::Bucket(b) = item {
            if b.id == entry.bucket_id {
                b.choose_args.insert(name.to_string(), entry);
                return;
            }
            attach(&mut b.children, name, entry.clone());
        }
    }
}

/// Collect every bucket's `choose_args` entry for `name` back into the
/// canonical split form, sorted by bucket id, removing them from the
/// buckets as it goes.
pub fn split(map: &mut CrushMap, name: &str) {
    let mut entries = Vec::new();
    collect(&mut map.trees, name, &mut entries);
    entries.sort_by_key(|e: &ChooseArgsEntry| e.bucket_id);
    if entries.is_empty() {
        map.choose_args.remove(name);
    } else {
        map.choose_args.insert(name.to_string(), entries);
    }
}

fn collect(items: &mut [Item], name: &str, out: &mut Vec<ChooseArgsEntry>) {
    for item in items.iter_mut() {
        if let Item::Bucket(b) = item {
            if let Some(entry) = b.choose_args.remove(name) {
                out.push(entry);
            }
            collect(&mut b.children, name, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Weight;
    use crate::types::{Bucket, BucketAlgorithm, Device};
    use std::collections::HashMap;

    fn two_level_map() -> CrushMap {
        let leaf = Item::Bucket(Bucket {
            id: -2,
            name: "host0".into(),
            r#type: "host".into(),
            algorithm: BucketAlgorithm::Straw2,
            weight: Weight::ONE,
            children: vec![Item::Device(Device { id: 0, name: "osd.0".into(), weight: Weight::ONE })],
            choose_args: HashMap::new(),
        });
        let root = Item::Bucket(Bucket {
            id: -1,
            name: "root".into(),
            r#type: "root".into(),
            algorithm: BucketAlgorithm::Straw2,
            weight: Weight::ONE,
            children: vec![leaf],
            choose_args: HashMap::new(),
        });
        let mut choose_args = HashMap::new();
        choose_args.insert(
            "optimized".to_string(),
            vec![
                ChooseArgsEntry { bucket_id: -1, ids: None, weight_set: Some(vec![vec![Weight::ONE]]) },
                ChooseArgsEntry { bucket_id: -2, ids: None, weight_set: Some(vec![vec![Weight::ZERO]]) },
            ],
        );
        CrushMap { trees: vec![root], choose_args, ..Default::default() }
    }

    #[test]
    fn merge_then_split_round_trips() {
        let mut map = two_level_map();
        let original = map.choose_args.get("optimized").unwrap().clone();

        merge(&mut map, "optimized");
        assert!(map.choose_args.get("optimized").is_none());
        let root = map.trees[0].as_bucket().unwrap();
        assert!(root.choose_args.contains_key("optimized"));
        let leaf = root.children[0].as_bucket().unwrap();
        assert!(leaf.choose_args.contains_key("optimized"));

        split(&mut map, "optimized");
        let mut roundtripped = map.choose_args.get("optimized").unwrap().clone();
        roundtripped.sort_by_key(|e| e.bucket_id);
        let mut expected = original;
        expected.sort_by_key(|e| e.bucket_id);
        assert_eq!(roundtripped, expected);
    }
}
