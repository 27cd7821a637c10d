//! Expected-vs-observed occupancy analysis.
//!
//! Grounded in the reference implementation's `crush/analyze.py`: collect
//! every item's path from the rule's `take` target down to the leaves,
//! normalize weight per type layer, simulate `values_count` mappings, tally
//! objects against every ancestor on each selected device's path, and
//! report `over/under used %` relative to each item's expected share.
//!
//! Supplemented beyond the reference implementation: weight cropping for
//! overweighted items, and a failure-domain worst-case stress test that
//! removes each failure-domain item in turn, re-simulates the rule on the
//! pruned map, and aggregates the largest over-filled percent observed for
//! each remaining type.

use crate::error::{CrushError, Result};
use crate::types::{CrushMap, Item, ItemId, RuleStep};
use crate::weights::WeightOverrides;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub id: ItemId,
    pub name: String,
    pub r#type: String,
    /// Raw (uncropped) weight.
    pub weight: f64,
    /// Weight after cropping overweighted items; equal to `weight` for
    /// items that were not overweighted.
    pub cropped_weight: f64,
    /// `(weight - cropped_weight) / weight * 100`; zero unless this item
    /// was overweighted.
    pub crop_pct: f64,
    /// Cropped weight normalized against the sum of cropped weights of
    /// items of the same type under the analyzed root.
    pub normalized_weight: f64,
    pub objects: u64,
    pub expected_objects: u64,
    /// `(objects / expected - 1) * 100 - crop_pct`.
    pub over_under_used_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub replication_count: usize,
    pub values_count: u32,
    /// Report type; defaults to the rule's first `choose`/`chooseleaf`
    /// failure domain when `None`.
    pub report_type: Option<String>,
}

/// Run the simulation described by `options` for `rule_name` and report
/// per-item occupancy for `options.report_type` (or the rule's failure
/// domain).
pub fn analyze(map: &CrushMap, rule_name: &str, options: &AnalyzeOptions) -> Result<Vec<ItemReport>> {
    let rule = map
        .rules
        .get(rule_name)
        .ok_or_else(|| CrushError::RuleNotFound(rule_name.to_string()))?;
    let (take, failure_domain) = rule_shape(rule_name, rule)?;
    let report_type = options.report_type.clone().unwrap_or(failure_domain);

    let root = find_named(&map.trees, &take).ok_or_else(|| CrushError::ItemNotFound(take.clone()))?;

    let paths = collect_paths(root);
    let layer: Vec<(ItemId, f64)> = paths
        .values()
        .filter(|i| i.type_name() == report_type)
        .map(|i| (i.id(), i.weight().as_f64()))
        .collect();
    let cropped = crop_layer(&layer, options.replication_count);

    let mut objects: HashMap<ItemId, u64> = HashMap::new();
    let weights = WeightOverrides::default();
    for value in 0..options.values_count {
        let selected = crate::mapper::map_rule(map, rule_name, value, options.replication_count, &weights, None)?;
        let got = selected.iter().filter(|&&d| d != crate::mapper::ITEM_NONE).count();
        if got < options.replication_count {
            return Err(CrushError::BadMapping { value, got, want: options.replication_count });
        }
        for device in selected {
            if device == crate::mapper::ITEM_NONE {
                continue;
            }
            for ancestor in ancestors_of(root, device) {
                *objects.entry(ancestor).or_insert(0) += 1;
            }
        }
    }

    let total_objects = (options.replication_count as u64) * (options.values_count as u64);
    let cropped_total: f64 = cropped.values().map(|c| c.cropped_weight).sum();

    let mut nweights = Vec::with_capacity(layer.len());
    for item in paths.values().filter(|i| i.type_name() == report_type) {
        let c = &cropped[&item.id()];
        let nweight = if cropped_total > 0.0 { c.cropped_weight / cropped_total } else { 0.0 };
        nweights.push((item.id(), nweight));
    }
    let expected = distribute_expected(&nweights, total_objects);

    let mut reports = Vec::new();
    for item in paths.values() {
        if item.type_name() != report_type {
            continue;
        }
        let c = &cropped[&item.id()];
        let nweight = if cropped_total > 0.0 { c.cropped_weight / cropped_total } else { 0.0 };
        let expected_objects = expected.get(&item.id()).copied().unwrap_or(0);
        let actual = objects.get(&item.id()).copied().unwrap_or(0);
        let over_under = if expected_objects > 0 {
            (actual as f64 / expected_objects as f64 - 1.0) * 100.0 - c.crop_pct
        } else {
            0.0
        };
        reports.push(ItemReport {
            id: item.id(),
            name: item.name().to_string(),
            r#type: item.type_name().to_string(),
            weight: c.raw_weight,
            cropped_weight: c.cropped_weight,
            crop_pct: c.crop_pct,
            normalized_weight: nweight,
            objects: actual,
            expected_objects,
            over_under_used_pct: over_under,
        });
    }

    reports.sort_by(|a, b| b.over_under_used_pct.partial_cmp(&a.over_under_used_pct).unwrap());
    Ok(reports)
}

#[derive(Debug, Clone, Copy)]
struct Cropped {
    raw_weight: f64,
    cropped_weight: f64,
    crop_pct: f64,
}

/// Cap any item whose raw weight exceeds `total / R` (it cannot be filled
/// proportionally — no placement can put more than one replica per item of
/// this type), replacing its weight with the average weight of the
/// not-overweighted items of the same type. Iterates to a fixed point since
/// capping one item can push the average down far enough to make a
/// previously fine item overweighted.
///
/// The spec's prose formula `tw_not_overweighted / (R - overweighted_count)`
/// and its worked example (S2: `3/(4-3)=3` for hosts weighted
/// `[7,7,7,3,3]`, R=4) are mutually inconsistent unless
/// `tw_not_overweighted` denotes the *average* (not the sum) of the
/// not-overweighted items' weight: that reading reproduces the worked
/// example exactly (`(3+3)/2 = 3`) and is what this crate implements
/// (DESIGN.md open-question resolution).
fn crop_layer(items: &[(ItemId, f64)], replication_count: usize) -> HashMap<ItemId, Cropped> {
    let r = replication_count.max(1);
    let mut overweighted: HashMap<ItemId, bool> = items.iter().map(|(id, _)| (*id, false)).collect();

    loop {
        let total: f64 = items.iter().map(|(_, w)| *w).sum();
        let cap = total / r as f64;
        let mut changed = false;
        for (id, w) in items {
            if !overweighted[id] && *w > cap {
                overweighted.insert(*id, true);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let not_overweighted: Vec<f64> =
        items.iter().filter(|(id, _)| !overweighted[id]).map(|(_, w)| *w).collect();
    let avg_not_overweighted = if not_overweighted.is_empty() {
        0.0
    } else {
        not_overweighted.iter().sum::<f64>() / not_overweighted.len() as f64
    };

    items
        .iter()
        .map(|(id, w)| {
            if overweighted[id] && *w > 0.0 {
                let crop_pct = (*w - avg_not_overweighted) / *w * 100.0;
                (*id, Cropped { raw_weight: *w, cropped_weight: avg_not_overweighted, crop_pct })
            } else {
                (*id, Cropped { raw_weight: *w, cropped_weight: *w, crop_pct: 0.0 })
            }
        })
        .collect()
}

/// `round(total * nweight_i)` per item with a deterministic remainder
/// distribution (largest-remainder method) so `sum(expected) == total`
/// exactly. Ties in the fractional part are broken by ascending item id for
/// reproducibility.
fn distribute_expected(nweights: &[(ItemId, f64)], total: u64) -> HashMap<ItemId, u64> {
    let mut floors = Vec::with_capacity(nweights.len());
    let mut assigned: u64 = 0;
    for (id, nw) in nweights {
        let exact = nw * total as f64;
        let floor = exact.floor();
        floors.push((*id, floor as u64, exact - floor));
        assigned += floor as u64;
    }
    let mut remainder = total.saturating_sub(assigned);
    floors.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap().then_with(|| a.0.cmp(&b.0)));
    let mut out: HashMap<ItemId, u64> = HashMap::new();
    for (id, floor, _) in &floors {
        let bump = if remainder > 0 { remainder -= 1; 1 } else { 0 };
        out.insert(*id, floor + bump);
    }
    out
}

fn rule_shape(rule_name: &str, rule: &crate::types::Rule) -> Result<(String, String)> {
    let mut take = None;
    let mut failure_domain = None;
    for step in &rule.steps {
        match step {
            RuleStep::Take { bucket } => take = Some(bucket.clone()),
            RuleStep::Choose { r#type, .. } | RuleStep::Chooseleaf { r#type, .. } => {
                failure_domain = Some(r#type.clone());
            }
            _ => {}
        }
    }
    match (take, failure_domain) {
        (Some(t), Some(f)) => Ok((t, f)),
        _ => Err(CrushError::RuleShape {
            rule: rule_name.to_string(),
            step: 0,
            message: "rule has no take/choose pair".into(),
        }),
    }
}

fn find_named<'a>(items: &'a [Item], name: &str) -> Option<&'a Item> {
    for item in items {
        if item.name() == name {
            return Some(item);
        }
        if let Item::Bucket(b) = item {
            if let Some(found) = find_named(&b.children, name) {
                return Some(found);
            }
        }
    }
    None
}

fn collect_paths(root: &Item) -> HashMap<ItemId, &Item> {
    let mut out = HashMap::new();
    fn walk<'a>(item: &'a Item, out: &mut HashMap<ItemId, &'a Item>) {
        out.insert(item.id(), item);
        if let Item::Bucket(b) = item {
            for c in &b.children {
                walk(c, out);
            }
        }
    }
    walk(root, &mut out);
    out
}

/// Every ancestor of `target` within `root`'s subtree, target included.
fn ancestors_of(root: &Item, target: ItemId) -> Vec<ItemId> {
    let mut path = Vec::new();
    fn walk(item: &Item, target: ItemId, trail: &mut Vec<ItemId>) -> bool {
        trail.push(item.id());
        if item.id() == target {
            return true;
        }
        if let Item::Bucket(b) = item {
            for c in &b.children {
                if walk(c, target, trail) {
                    return true;
                }
            }
        }
        trail.pop();
        false
    }
    walk(root, target, &mut path);
    path
}

/// For every item of the rule's failure-domain type, remove it (and its
/// subtree) from a cloned map, consistently scrubbing overlays along the
/// way, and re-simulate the rule on what's left. Reports, per remaining
/// type, the largest over-filled percent observed across every removal —
/// the worst-case occupancy skew a single failure-domain outage can cause.
///
/// Skipped (returning an empty map, with a log line) when the failure
/// domain is `device` itself, or when there are too few candidates for any
/// removal to still satisfy the rule's replication count.
pub fn worst_case_failure_domain(
    map: &CrushMap,
    rule_name: &str,
    options: &AnalyzeOptions,
) -> Result<HashMap<String, f64>> {
    let rule = map
        .rules
        .get(rule_name)
        .ok_or_else(|| CrushError::RuleNotFound(rule_name.to_string()))?;
    let (take, failure_domain) = rule_shape(rule_name, rule)?;

    if failure_domain == "device" {
        tracing::info!(rule = rule_name, "failure domain is device, skipping worst-case simulation");
        return Ok(HashMap::new());
    }

    let root = find_named(&map.trees, &take).ok_or_else(|| CrushError::ItemNotFound(take.clone()))?;
    let paths = collect_paths(root);
    let candidates: Vec<ItemId> =
        paths.values().filter(|i| i.type_name() == failure_domain).map(|i| i.id()).collect();

    if candidates.len() < options.replication_count + 1 {
        tracing::warn!(
            rule = rule_name,
            candidates = candidates.len(),
            required = options.replication_count + 1,
            "too few failure-domain candidates to simulate worst case, skipping"
        );
        return Ok(HashMap::new());
    }

    let mut type_names = Vec::new();
    {
        let mut seen = std::collections::HashSet::new();
        for item in paths.values() {
            if seen.insert(item.type_name().to_string()) {
                type_names.push(item.type_name().to_string());
            }
        }
    }

    let mut worst: HashMap<String, f64> = HashMap::new();
    for victim in candidates {
        let mut pruned = map.clone();
        crate::filter::remove_where(&mut pruned, |item| item.id() == victim);

        for type_name in &type_names {
            let per_type = AnalyzeOptions {
                replication_count: options.replication_count,
                values_count: options.values_count,
                report_type: Some(type_name.clone()),
            };
            let reports = match analyze(&pruned, rule_name, &per_type) {
                Ok(r) => r,
                Err(CrushError::BadMapping { .. }) | Err(CrushError::ItemNotFound(_)) => {
                    tracing::warn!(
                        victim,
                        r#type = %type_name,
                        "skipping failure-domain simulation, mapping unsatisfiable after removal"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let max_over = reports.iter().map(|r| r.over_under_used_pct).fold(0.0_f64, f64::max);
            let entry = worst.entry(type_name.clone()).or_insert(0.0);
            if max_over > *entry {
                *entry = max_over;
            }
        }
    }

    Ok(worst)
}
