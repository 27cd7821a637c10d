//! Move-counting comparator between two crushmaps.
//!
//! Grounded in the reference implementation's `crush/compare.py`: for each
//! bucket present in both maps, classify what each replica position used
//! to map to and what it maps to now. `order_matters` selects between two
//! pairing strategies — positional (`ar[i]` vs `br[i]`, sensitive to
//! reordering) and set-difference (only additions/removals count, order
//! within a replica list is free) — matching `compare.py::compare`'s two
//! modes.

use crate::mapper::ITEM_NONE;
use crate::types::{CrushMap, Item, ItemId};
use crate::weights::WeightOverrides;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketMoves {
    /// `from_item -> to_item -> count`, grouped per originating item.
    pub from_to: HashMap<ItemId, HashMap<ItemId, u32>>,
    /// moved-in count, moved-out count, per bucket.
    pub in_out: HashMap<ItemId, (u32, u32)>,
    pub total_moved: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CompareOptions {
    pub replication_count: usize,
    pub values_count: u32,
    pub order_matters: bool,
}

/// Compare how `rule_name` maps `options.values_count` values under `before`
/// and `after`, counting every replica move regardless of where it lands.
pub fn compare(
    before: &CrushMap,
    after: &CrushMap,
    rule_name: &str,
    options: &CompareOptions,
) -> crate::error::Result<BucketMoves> {
    let weights = WeightOverrides::default();
    let mut moves = BucketMoves::default();

    for value in 0..options.values_count {
        let (from_list, to_list) = (
            crate::mapper::map_rule(before, rule_name, value, options.replication_count, &weights, None)?,
            crate::mapper::map_rule(after, rule_name, value, options.replication_count, &weights, None)?,
        );
        for (from, to) in pairs_for(&from_list, &to_list, options.order_matters) {
            if from == to {
                continue;
            }
            *moves.from_to.entry(from).or_default().entry(to).or_insert(0) += 1;
            if from != ITEM_NONE {
                moves.in_out.entry(from).or_insert((0, 0)).1 += 1;
            }
            if to != ITEM_NONE {
                moves.in_out.entry(to).or_insert((0, 0)).0 += 1;
            }
            moves.total_moved += 1;
        }
    }

    Ok(moves)
}

/// Compare `before` and `after` restricted to `bucket_id`: a move whose
/// origin and destination both fall within the bucket's subtree is
/// classified intra-bucket (`from_to`); a move crossing the bucket's
/// boundary in either direction is classified `in_out`; a move that never
/// touches the bucket at all is not counted. This is the classification the
/// optimizer's per-bucket step budget is measured against.
pub fn compare_against_bucket(
    before: &CrushMap,
    after: &CrushMap,
    rule_name: &str,
    options: &CompareOptions,
    bucket_id: ItemId,
) -> crate::error::Result<BucketMoves> {
    let weights = WeightOverrides::default();
    let before_subtree = subtree_ids(before, bucket_id);
    let after_subtree = subtree_ids(after, bucket_id);
    let mut moves = BucketMoves::default();

    for value in 0..options.values_count {
        let (from_list, to_list) = (
            crate::mapper::map_rule(before, rule_name, value, options.replication_count, &weights, None)?,
            crate::mapper::map_rule(after, rule_name, value, options.replication_count, &weights, None)?,
        );
        for (from, to) in pairs_for(&from_list, &to_list, options.order_matters) {
            if from == to {
                continue;
            }
            let from_in = from != ITEM_NONE && before_subtree.contains(&from);
            let to_in = to != ITEM_NONE && after_subtree.contains(&to);
            if !from_in && !to_in {
                continue;
            }
            if from_in && to_in {
                *moves.from_to.entry(from).or_default().entry(to).or_insert(0) += 1;
            } else {
                if from_in {
                    moves.in_out.entry(bucket_id).or_insert((0, 0)).1 += 1;
                }
                if to_in {
                    moves.in_out.entry(bucket_id).or_insert((0, 0)).0 += 1;
                }
            }
            moves.total_moved += 1;
        }
    }

    Ok(moves)
}

fn pairs_for(a: &[ItemId], b: &[ItemId], order_matters: bool) -> Vec<(ItemId, ItemId)> {
    if order_matters {
        a.iter().zip(b.iter()).map(|(&x, &y)| (x, y)).collect()
    } else {
        set_difference_pairs(a, b)
    }
}

/// Pair residues after removing the common multiset of items from `a` and
/// `b`; unpaired leftovers are matched positionally (`ar[i] -> br[i]`),
/// matching `compare.py::compare`'s set-difference mode.
fn set_difference_pairs(a: &[ItemId], b: &[ItemId]) -> Vec<(ItemId, ItemId)> {
    let mut a_multiset: HashMap<ItemId, u32> = HashMap::new();
    for &x in a {
        *a_multiset.entry(x).or_insert(0) += 1;
    }
    let mut b_remaining: Vec<ItemId> = Vec::new();
    for &y in b {
        if let Some(count) = a_multiset.get_mut(&y) {
            if *count > 0 {
                *count -= 1;
                continue;
            }
        }
        b_remaining.push(y);
    }
    let a_remaining: Vec<ItemId> = a
        .iter()
        .copied()
        .filter(|x| {
            let count = a_multiset.get_mut(x).unwrap();
            if *count > 0 {
                *count -= 1;
                true
            } else {
                false
            }
        })
        .collect();

    a_remaining.into_iter().zip(b_remaining).collect()
}

/// Every item id reachable within `bucket_id`'s subtree, `bucket_id`
/// included.
fn subtree_ids(map: &CrushMap, bucket_id: ItemId) -> HashSet<ItemId> {
    fn collect_all(item: &Item, out: &mut HashSet<ItemId>) {
        out.insert(item.id());
        if let Item::Bucket(b) = item {
            for c in &b.children {
                collect_all(c, out);
            }
        }
    }
    fn find(item: &Item, bucket_id: ItemId, out: &mut HashSet<ItemId>) -> bool {
        if item.id() == bucket_id {
            collect_all(item, out);
            return true;
        }
        if let Item::Bucket(b) = item {
            for c in &b.children {
                if find(c, bucket_id, out) {
                    return true;
                }
            }
        }
        false
    }
    let mut out = HashSet::new();
    for tree in &map.trees {
        if find(tree, bucket_id, &mut out) {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::Weight;
    use crate::types::{Bucket, BucketAlgorithm, Device};
    use std::collections::HashMap as Map;

    #[test]
    fn set_difference_ignores_shared_items() {
        let a = vec![1, 2, 3];
        let b = vec![1, 2, 4];
        let pairs = set_difference_pairs(&a, &b);
        assert_eq!(pairs, vec![(3, 4)]);
    }

    #[test]
    fn set_difference_handles_pure_reorder() {
        let a = vec![1, 2, 3];
        let b = vec![3, 1, 2];
        let pairs = set_difference_pairs(&a, &b);
        assert!(pairs.is_empty());
    }

    fn two_host_map() -> CrushMap {
        let host = |id: i32, name: &str, dev_id: i32| {
            Item::Bucket(Bucket {
                id,
                name: name.into(),
                r#type: "host".into(),
                algorithm: BucketAlgorithm::Straw2,
                weight: Weight::ONE,
                children: vec![Item::Device(Device {
                    id: dev_id,
                    name: format!("osd.{dev_id}"),
                    weight: Weight::ONE,
                })],
                choose_args: Map::new(),
            })
        };
        let root = Item::Bucket(Bucket {
            id: -1,
            name: "root".into(),
            r#type: "root".into(),
            algorithm: BucketAlgorithm::Straw2,
            weight: Weight::from_f64(2.0),
            children: vec![host(-2, "host0", 0), host(-3, "host1", 1)],
            choose_args: Map::new(),
        });
        let mut rules = Map::new();
        rules.insert(
            "replicated".to_string(),
            crate::types::Rule {
                steps: vec![
                    crate::types::RuleStep::Take { bucket: "root".into() },
                    crate::types::RuleStep::Chooseleaf {
                        mode: crate::types::SelectMode::FirstN,
                        num: 1,
                        r#type: "device".into(),
                    },
                    crate::types::RuleStep::Emit,
                ],
            },
        );
        CrushMap { trees: vec![root], rules, tunables: Default::default(), choose_args: Map::new() }
    }

    #[test]
    fn compare_against_bucket_ignores_moves_outside_subtree() {
        let map = two_host_map();
        let options = CompareOptions { replication_count: 1, values_count: 100, order_matters: false };
        // Comparing a map against itself, restricted to host1's subtree,
        // must report no moves at all: nothing changed anywhere.
        let moves = compare_against_bucket(&map, &map, "replicated", &options, -3).unwrap();
        assert_eq!(moves.total_moved, 0);
    }
}
