//! Bucket selection algorithms.
//!
//! Each function picks one child id out of a bucket's effective child list.
//! "Effective" accounts for two overlays applied before the draw: a
//! `choose_args` entry (which may replace the child id order and/or the
//! weight used at a given replica position) and an ephemeral per-call
//! weights dictionary (which scales a device's weight into `[0, w]`).
//! Both overlays are resolved by [`effective_children`]; the per-algorithm
//! functions below never see a [`Bucket`] directly.

use crate::fixed::Weight;
use crate::hash::{bucket_select_hash, straw2_draw_hash};
use crate::types::{Bucket, BucketAlgorithm, ChooseArgsEntry, ItemId};

/// One child's id and effective (overlay-applied, ephemeral-scaled) weight.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveChild {
    pub id: ItemId,
    pub weight: Weight,
}

/// Resolve a bucket's children for one replica position, applying the
/// `choose_args` overlay (id order / weight_set row) and then the
/// per-call weight override.
pub fn effective_children(
    bucket: &Bucket,
    overlay: Option<&ChooseArgsEntry>,
    position: usize,
    weight_of: &dyn Fn(ItemId) -> f64,
) -> Vec<EffectiveChild> {
    let base_ids: Vec<ItemId> = match overlay.and_then(|o| o.ids.as_ref()) {
        Some(ids) => ids.clone(),
        None => bucket.children.iter().map(|c| c.id()).collect(),
    };

    let weight_row = overlay.and_then(|o| o.weight_row(position));

    base_ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            let base = weight_row
                .and_then(|row| row.get(i).copied())
                .unwrap_or_else(|| {
                    bucket
                        .children
                        .iter()
                        .find(|c| c.id() == id)
                        .map(|c| c.weight())
                        .unwrap_or(Weight::ZERO)
                });
            let scaled = base.scale(weight_of(id));
            EffectiveChild { id, weight: scaled }
        })
        .collect()
}

/// Select a child from `bucket` at hash input `(value, attempt)` for replica
/// `replica`. Returns `None` only when the bucket has no children.
pub fn bucket_choose(
    bucket: &Bucket,
    children: &[EffectiveChild],
    value: u32,
    replica: u32,
    attempt: u32,
) -> Option<ItemId> {
    if children.is_empty() {
        return None;
    }
    match bucket.algorithm {
        BucketAlgorithm::Straw2 => straw2_choose(bucket.id, children, value, attempt),
        BucketAlgorithm::Uniform => uniform_choose(children, value, replica),
        BucketAlgorithm::List => list_choose(bucket.id, children, value, replica),
        BucketAlgorithm::Straw => straw_choose(bucket.id, children, value, replica),
    }
}

/// Straw2: every child draws an independent exponential-distribution
/// straw; the longest straw wins. Ties broken by lowest index,
/// matching the `i == 0 || draw > high_draw` scan order used by the
/// reference algorithm.
fn straw2_choose(
    bucket_id: ItemId,
    children: &[EffectiveChild],
    value: u32,
    attempt: u32,
) -> Option<ItemId> {
    let _ = bucket_id;
    let mut high = 0usize;
    let mut high_draw = f64::NEG_INFINITY;
    for (i, child) in children.iter().enumerate() {
        let draw = straw2_draw(value, child.id, attempt, child.weight);
        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }
    Some(children[high].id)
}

/// `ln(u) / weight` where `u` is a per-child uniform draw in `(0, 1)`.
/// Weight zero always loses (`-inf`). `ln` is taken directly via `f64`
/// rather than a fixed-point lookup table: the teacher crate's log table
/// module was not part of the retrieved pack, so this crate computes the
/// same monotonic quantity with `f64::ln` instead of fabricating table
/// contents.
fn straw2_draw(value: u32, child_id: ItemId, attempt: u32, weight: Weight) -> f64 {
    if weight.is_zero() {
        return f64::NEG_INFINITY;
    }
    let h = straw2_draw_hash(value, child_id, attempt);
    let u = ((h & 0xffff) as f64 + 1.0) / 65537.0; // in (0, 1), never exactly 0
    u.ln() / weight.as_f64()
}

/// Uniform: O(1) selection by `hash(value, replica) mod n`. Per the
/// algorithm's definition all children are assumed equal weight; an
/// all-zero bucket has already been filtered out by the caller, but an
/// individually zero-weighted child can still be returned here exactly as
/// the reference algorithm does (uniform buckets are not meant to hold
/// mixed weights).
fn uniform_choose(children: &[EffectiveChild], value: u32, replica: u32) -> Option<ItemId> {
    let hash = bucket_select_hash(value, 0, replica, 0);
    let index = (hash as usize) % children.len();
    Some(children[index].id)
}

/// List: legacy head-to-tail weighted draw, scanned from the most recently
/// added (last) child backward.
fn list_choose(
    bucket_id: ItemId,
    children: &[EffectiveChild],
    value: u32,
    replica: u32,
) -> Option<ItemId> {
    let sum: u64 = children.iter().map(|c| c.weight.raw() as u64).sum();
    let mut remaining = sum;
    for child in children.iter().rev() {
        if remaining == 0 {
            continue;
        }
        let h = bucket_select_hash(value, bucket_id, replica, child.id as u32) as u64;
        let mut w = h & 0xffff;
        w = w.wrapping_mul(remaining);
        w >>= 16;
        if w < child.weight.raw() as u64 {
            return Some(child.id);
        }
        remaining -= child.weight.raw() as u64;
    }
    children.first().map(|c| c.id)
}

/// Straw (legacy, gated behind `Tunables::allow_legacy`): each child draws
/// `hash * straw_length`, longest straw wins. Straw lengths here are
/// derived from weight directly (proportional straw), unlike straw2's
/// exponential draw — this is the known non-optimal-movement property that
/// motivated straw2.
fn straw_choose(
    bucket_id: ItemId,
    children: &[EffectiveChild],
    value: u32,
    replica: u32,
) -> Option<ItemId> {
    let mut high = 0usize;
    let mut high_draw = 0u64;
    for (i, child) in children.iter().enumerate() {
        let h = bucket_select_hash(value, bucket_id, replica, child.id as u32) as u64;
        let draw = (h & 0xffff).wrapping_mul(child.weight.raw() as u64);
        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }
    Some(children[high].id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketAlgorithm, Device, Item};
    use std::collections::HashMap;

    fn bucket(algorithm: BucketAlgorithm, n: usize) -> Bucket {
        let children = (0..n)
            .map(|i| {
                Item::Device(Device { id: i as i32, name: format!("osd.{i}"), weight: Weight::ONE })
            })
            .collect();
        Bucket {
            id: -1,
            name: "root".into(),
            r#type: "root".into(),
            algorithm,
            weight: Weight::from_f64(n as f64),
            children,
            choose_args: HashMap::new(),
        }
    }

    fn no_overlay(b: &Bucket, pos: usize) -> Vec<EffectiveChild> {
        effective_children(b, None, pos, &|_| 1.0)
    }

    #[test]
    fn straw2_deterministic_and_in_range() {
        let b = bucket(BucketAlgorithm::Straw2, 5);
        let children = no_overlay(&b, 0);
        let a = bucket_choose(&b, &children, 123, 0, 0).unwrap();
        let a2 = bucket_choose(&b, &children, 123, 0, 0).unwrap();
        assert_eq!(a, a2);
        assert!((0..5).contains(&a));
    }

    #[test]
    fn straw2_zero_weight_never_wins() {
        let mut b = bucket(BucketAlgorithm::Straw2, 3);
        if let Item::Device(d) = &mut b.children[1] {
            d.weight = Weight::ZERO;
        }
        let children = no_overlay(&b, 0);
        for value in 0..200u32 {
            let picked = bucket_choose(&b, &children, value, 0, 0).unwrap();
            assert_ne!(picked, 1);
        }
    }

    #[test]
    fn uniform_stays_in_range() {
        let b = bucket(BucketAlgorithm::Uniform, 4);
        let children = no_overlay(&b, 0);
        let picked = bucket_choose(&b, &children, 77, 2, 0).unwrap();
        assert!((0..4).contains(&picked));
    }

    #[test]
    fn list_zero_weight_never_wins() {
        let mut b = bucket(BucketAlgorithm::List, 3);
        if let Item::Device(d) = &mut b.children[2] {
            d.weight = Weight::ZERO;
        }
        let children = no_overlay(&b, 0);
        for value in 0..200u32 {
            let picked = bucket_choose(&b, &children, value, 0, 0).unwrap();
            assert_ne!(picked, 2);
        }
    }

    #[test]
    fn overlay_ids_override_draw_order() {
        let b = bucket(BucketAlgorithm::Straw2, 3);
        let overlay = ChooseArgsEntry {
            bucket_id: b.id,
            ids: Some(vec![2, 1, 0]),
            weight_set: None,
        };
        let children = effective_children(&b, Some(&overlay), 0, &|_| 1.0);
        assert_eq!(children.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn ephemeral_weight_zero_excludes_child() {
        let b = bucket(BucketAlgorithm::Straw2, 3);
        let children = effective_children(&b, None, 0, &|id| if id == 0 { 0.0 } else { 1.0 });
        for value in 0..200u32 {
            let picked = bucket_choose(&b, &children, value, 0, 0).unwrap();
            assert_ne!(picked, 0);
        }
    }
}
