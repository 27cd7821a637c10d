//! The rule interpreter: executes a named rule's `take`/`choose[leaf]`/
//! `emit` program against a [`CrushMap`].
//!
//! FirstN and Indep only differ in what happens when a replica position
//! can't be resolved after exhausting its retry budget: FirstN simply
//! leaves it out (the result is shorter than requested), Indep fills the
//! position with [`ITEM_NONE`] so that replica *positions* stay stable —
//! the property erasure-coded pools rely on.

use crate::bucket::{bucket_choose, effective_children};
use crate::error::{CrushError, Result};
use crate::types::{ChooseArgsEntry, CrushMap, Item, ItemId, RuleStep, SelectMode};
use crate::weights::WeightOverrides;
use std::collections::HashMap;

/// Sentinel written into an Indep-mode result slot that could not be
/// resolved, so that later positions don't shift down.
pub const ITEM_NONE: ItemId = ItemId::MAX;

/// Map `value` through `rule_name`, requesting `replication_count` items.
/// A rule step's own `num` of `0` means "use `replication_count`"; negative
/// means `replication_count - |num|`.
pub fn map_rule(
    map: &CrushMap,
    rule_name: &str,
    value: u32,
    replication_count: usize,
    weights: &WeightOverrides,
    choose_args_name: Option<&str>,
) -> Result<Vec<ItemId>> {
    let rule = map
        .rules
        .get(rule_name)
        .ok_or_else(|| CrushError::RuleNotFound(rule_name.to_string()))?;

    let index = Index::build(map);
    let overlay = choose_args_name
        .map(|name| {
            map.choose_args
                .get(name)
                .ok_or_else(|| CrushError::ChooseArgsNotFound(name.to_string()))
        })
        .transpose()?
        .map(|entries| {
            entries
                .iter()
                .map(|e| (e.bucket_id, e))
                .collect::<HashMap<ItemId, &ChooseArgsEntry>>()
        })
        .unwrap_or_default();

    let ctx = Ctx { index: &index, weights, overlay: &overlay };

    let mut work: Vec<ItemId> = Vec::new();
    let mut result: Vec<ItemId> = Vec::new();
    // `set_choose_tries`/`set_chooseleaf_tries` scope to the steps between
    // here and the next `emit`; `None` means "use the mode's default",
    // computed per step since the chooseleaf default itself depends on
    // firstn vs. indep.
    let mut choose_tries_override: Option<u32> = None;
    let mut chooseleaf_tries_override: Option<u32> = None;

    for step in &rule.steps {
        match step {
            RuleStep::Take { bucket } => {
                let id = index
                    .by_name
                    .get(bucket.as_str())
                    .copied()
                    .ok_or_else(|| CrushError::ItemNotFound(bucket.clone()))?;
                work = vec![id];
            }
            RuleStep::SetChooseTries { n } => choose_tries_override = Some(*n),
            RuleStep::SetChooseleafTries { n } => chooseleaf_tries_override = Some(*n),
            RuleStep::SetChooseLocalTries { .. } | RuleStep::SetChooseLocalFallbackTries { .. } => {
                tracing::warn!("legacy local-retry tunable accepted but has no distinct effect");
            }
            RuleStep::Choose { mode, num, r#type } => {
                let numrep = resolve_numrep(*num, replication_count);
                // `choose` never descends to a leaf, so only the outer
                // budget applies; pass it through unused for the inner one.
                let choose_tries = choose_tries_override.unwrap_or(map.tunables.choose_total_tries + 1);
                let mut next = Vec::new();
                for &item in &work {
                    select_group(&ctx, item, value, numrep, r#type, false, *mode, choose_tries, choose_tries, &mut next)?;
                }
                work = next;
            }
            RuleStep::Chooseleaf { mode, num, r#type } => {
                let numrep = resolve_numrep(*num, replication_count);
                let choose_tries = choose_tries_override.unwrap_or(map.tunables.choose_total_tries + 1);
                // Inner (leaf-descent) retry budget asymmetry:
                // firstn defaults to the same N+1 as the outer budget;
                // indep defaults to a single try (failures should surface
                // as a hole, not be retried away).
                let chooseleaf_tries = chooseleaf_tries_override.unwrap_or(match mode {
                    SelectMode::FirstN => map.tunables.choose_total_tries + 1,
                    SelectMode::Indep => 1,
                });
                let mut next = Vec::new();
                for &item in &work {
                    select_group(&ctx, item, value, numrep, r#type, true, *mode, choose_tries, chooseleaf_tries, &mut next)?;
                }
                work = next;
            }
            RuleStep::Emit => {
                result.extend(work.iter().copied());
                work.clear();
                choose_tries_override = None;
                chooseleaf_tries_override = None;
            }
        }
    }

    Ok(result)
}

fn resolve_numrep(num: i32, replication_count: usize) -> usize {
    if num == 0 {
        replication_count
    } else if num > 0 {
        num as usize
    } else {
        replication_count.saturating_sub(num.unsigned_abs() as usize)
    }
}

struct Index<'a> {
    by_id: HashMap<ItemId, &'a Item>,
    by_name: HashMap<&'a str, ItemId>,
}

impl<'a> Index<'a> {
    fn build(map: &'a CrushMap) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        fn walk<'a>(item: &'a Item, by_id: &mut HashMap<ItemId, &'a Item>, by_name: &mut HashMap<&'a str, ItemId>) {
            by_id.insert(item.id(), item);
            by_name.insert(item.name(), item.id());
            if let Item::Bucket(b) = item {
                for child in &b.children {
                    walk(child, by_id, by_name);
                }
            }
        }
        for tree in &map.trees {
            walk(tree, &mut by_id, &mut by_name);
        }
        Index { by_id, by_name }
    }
}

struct Ctx<'a> {
    index: &'a Index<'a>,
    weights: &'a WeightOverrides,
    overlay: &'a HashMap<ItemId, &'a ChooseArgsEntry>,
}

/// Select `numrep` items of type `item_type` reachable from `start`,
/// appending results (and, in Indep mode, [`ITEM_NONE`] placeholders) to
/// `out`.
#[allow(clippy::too_many_arguments)]
fn select_group(
    ctx: &Ctx,
    start: ItemId,
    x: u32,
    numrep: usize,
    item_type: &str,
    recurse_to_leaf: bool,
    mode: SelectMode,
    choose_tries: u32,
    chooseleaf_tries: u32,
    out: &mut Vec<ItemId>,
) -> Result<()> {
    for rep in 0..numrep {
        let r = rep as u32;
        let picked = descend(ctx, start, x, r, choose_tries, chooseleaf_tries, item_type, recurse_to_leaf, out);
        match (mode, picked) {
            (_, Some(item)) => out.push(item),
            (SelectMode::FirstN, None) => {
                tracing::debug!("firstn: no item found for replica {}", rep);
            }
            (SelectMode::Indep, None) => {
                tracing::debug!("indep: leaving replica {} unresolved", rep);
                out.push(ITEM_NONE);
            }
        }
    }
    Ok(())
}

/// Descend from `start`, retrying up to `choose_tries` times at the
/// outermost bucket. When `recurse_to_leaf` is set and a chosen item is
/// itself a bucket, recurse with a fresh `chooseleaf_tries` budget rather
/// than continuing to consume the outer budget — this is the asymmetry
/// between `set_choose_tries` and `set_chooseleaf_tries`.
#[allow(clippy::too_many_arguments)]
fn descend(
    ctx: &Ctx,
    start: ItemId,
    x: u32,
    r: u32,
    choose_tries: u32,
    chooseleaf_tries: u32,
    item_type: &str,
    recurse_to_leaf: bool,
    out: &[ItemId],
) -> Option<ItemId> {
    if start >= 0 {
        // A device was taken directly; only valid if a device is wanted and
        // it isn't excluded by the ephemeral weights overlay.
        if item_type == "device" && ctx.weights.factor(start) > 0.0 && !out.contains(&start) {
            return Some(start);
        }
        return None;
    }

    let mut current = *ctx.index.by_id.get(&start)?;

    for ftotal in 0..choose_tries.max(1) {
        let r_prime = r + ftotal;
        let mut bucket_item = current;

        loop {
            let bucket = bucket_item.as_bucket()?;
            let overlay = ctx.overlay.get(&bucket.id).copied();
            let position = r as usize;
            let children = effective_children(bucket, overlay, position, &|id| ctx.weights.factor(id));
            let chosen = match bucket_choose(bucket, &children, x, r, r_prime) {
                Some(id) => id,
                None => break,
            };

            let chosen_item = ctx.index.by_id.get(&chosen).copied();
            let chosen_type = chosen_item.map(|i| i.type_name()).unwrap_or("device");

            if chosen_type != item_type {
                if chosen >= 0 {
                    break; // wrong-type device; retry from the top
                }
                // descend further into this bucket without spending a retry
                bucket_item = chosen_item?;
                continue;
            }

            if out.contains(&chosen) {
                break;
            }

            if chosen >= 0 {
                if ctx.weights.factor(chosen) <= 0.0 {
                    break;
                }
                return Some(chosen);
            }

            if recurse_to_leaf {
                return descend(ctx, chosen, x, 0, chooseleaf_tries, chooseleaf_tries, "device", true, out);
            }

            return Some(chosen);
        }

        current = *ctx.index.by_id.get(&start)?;
    }

    None
}
