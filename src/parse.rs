//! Normalization: turn a [`RawCrushMap`] document into a [`CrushMap`].
//!
//! Reference resolution walks the raw forest, substituting each
//! [`RawItem::Reference`] with a deep copy of its target (design note: the
//! tree is materialized rather than kept as a DAG, so downstream code never
//! has to reason about shared structure). Cycle detection happens during
//! that walk, since a reference cannot be resolved without first finishing
//! the subtree it points at.

use crate::error::{CrushError, Result};
use crate::types::{
    Bucket, BucketAlgorithm, CrushMap, Device, Item, RawBucket, RawCrushMap, RawDevice, RawItem,
    Rule, RuleStep,
};
use std::collections::HashMap;

/// Normalize a raw document into a [`CrushMap`], resolving references and
/// validating ids, names, rule shapes and legacy opt-ins.
pub fn normalize(raw: &RawCrushMap) -> Result<CrushMap> {
    let mut ctx = NormalizeCtx {
        raw_by_name: HashMap::new(),
        resolving: Vec::new(),
        seen_ids: HashMap::new(),
        seen_names: HashMap::new(),
        allow_legacy: raw.tunables.allow_legacy,
    };
    index_raw_items(&raw.trees, &mut ctx.raw_by_name, "<root>")?;

    let mut trees = Vec::with_capacity(raw.trees.len());
    for item in &raw.trees {
        trees.push(ctx.resolve(item, "<root>")?);
    }

    for (name, rule) in &raw.rules {
        validate_rule(name, rule, &raw.tunables)?;
    }

    for (name, entries) in &raw.choose_args {
        for entry in entries {
            if entry.ids.is_none() && entry.weight_set.is_none() {
                return Err(CrushError::OverlayShape {
                    name: name.clone(),
                    bucket_id: entry.bucket_id,
                    message: "entry carries neither ids nor weight_set".into(),
                });
            }
        }
    }

    Ok(CrushMap {
        trees,
        rules: raw.rules.clone(),
        tunables: raw.tunables.clone(),
        choose_args: raw.choose_args.clone(),
    })
}

struct NormalizeCtx<'a> {
    raw_by_name: HashMap<String, &'a RawItem>,
    resolving: Vec<String>,
    seen_ids: HashMap<i32, String>,
    seen_names: HashMap<String, String>,
    allow_legacy: bool,
}

fn index_raw_items<'a>(
    items: &'a [RawItem],
    out: &mut HashMap<String, &'a RawItem>,
    location: &str,
) -> Result<()> {
    for item in items {
        match item {
            RawItem::Bucket(b) => {
                if out.insert(b.name.clone(), item).is_some() {
                    return Err(CrushError::DuplicateName {
                        name: b.name.clone(),
                        first: location.into(),
                        second: location.into(),
                    });
                }
                index_raw_items(&b.children, out, &b.name)?;
            }
            RawItem::Device(d) => {
                out.insert(d.name.clone(), item);
            }
            RawItem::Reference(_) => {}
        }
    }
    Ok(())
}

impl<'a> NormalizeCtx<'a> {
    fn resolve(&mut self, item: &'a RawItem, location: &str) -> Result<Item> {
        match item {
            RawItem::Device(d) => self.resolve_device(d, location),
            RawItem::Bucket(b) => self.resolve_bucket(b, location),
            RawItem::Reference(r) => {
                if self.resolving.iter().any(|n| n == &r.reference_id) {
                    return Err(CrushError::CyclicReference { location: r.reference_id.clone() });
                }
                let target = *self.raw_by_name.get(&r.reference_id).ok_or_else(|| {
                    CrushError::DanglingReference {
                        location: location.to_string(),
                        target: r.reference_id.clone(),
                    }
                })?;
                self.resolving.push(r.reference_id.clone());
                let mut resolved = self.resolve(target, location)?;
                self.resolving.pop();
                if let Some(weight) = r.weight {
                    match &mut resolved {
                        Item::Bucket(b) => b.weight = weight,
                        Item::Device(d) => d.weight = weight,
                    }
                }
                Ok(resolved)
            }
        }
    }

    fn resolve_device(&mut self, d: &RawDevice, location: &str) -> Result<Item> {
        self.check_id(d.id, location)?;
        self.check_name(&d.name, location)?;
        Ok(Item::Device(Device {
            id: d.id,
            name: d.name.clone(),
            weight: d.weight.unwrap_or(crate::fixed::Weight::ONE),
        }))
    }

    fn resolve_bucket(&mut self, b: &'a RawBucket, location: &str) -> Result<Item> {
        let id = b.id.unwrap_or_else(|| synth_id(&b.name));
        self.check_id(id, location)?;
        self.check_name(&b.name, location)?;

        let algorithm = b.algorithm.unwrap_or_default();
        if algorithm == BucketAlgorithm::Straw && !self.allow_legacy {
            return Err(CrushError::BackwardCompatAlgorithm { algorithm: "straw".into() });
        }
        let mut children = Vec::with_capacity(b.children.len());
        let mut child_weight = crate::fixed::Weight::ZERO;
        for child in &b.children {
            let resolved = self.resolve(child, &b.name)?;
            child_weight = child_weight
                .checked_add(resolved.weight())
                .ok_or_else(|| CrushError::Schema {
                    location: b.name.clone(),
                    message: "aggregate child weight overflowed".into(),
                })?;
            children.push(resolved);
        }
        let weight = b.weight.unwrap_or(child_weight);

        Ok(Item::Bucket(Bucket {
            id,
            name: b.name.clone(),
            r#type: b.r#type.clone(),
            algorithm,
            weight,
            children,
            choose_args: HashMap::new(),
        }))
    }

    fn check_id(&mut self, id: i32, location: &str) -> Result<()> {
        if let Some(first) = self.seen_ids.insert(id, location.to_string()) {
            return Err(CrushError::DuplicateId { id, first, second: location.to_string() });
        }
        Ok(())
    }

    fn check_name(&mut self, name: &str, location: &str) -> Result<()> {
        if let Some(first) = self.seen_names.insert(name.to_string(), location.to_string()) {
            return Err(CrushError::DuplicateName {
                name: name.to_string(),
                first,
                second: location.to_string(),
            });
        }
        Ok(())
    }
}

/// Synthesize a stable negative id for a bucket that didn't specify one,
/// by hashing its name — buckets conventionally occupy the negative id
/// space, devices the non-negative one.
fn synth_id(name: &str) -> i32 {
    let h = crate::hash::crush_hash32_2(0, {
        let mut acc: u32 = 0;
        for b in name.as_bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(*b as u32);
        }
        acc
    });
    -((h & 0x7fff_ffff) as i32).abs().max(1)
}

fn validate_rule(name: &str, rule: &Rule, tunables: &crate::types::Tunables) -> Result<()> {
    if rule.steps.is_empty() {
        return Err(CrushError::RuleMissingEmit { rule: name.to_string() });
    }
    match rule.steps.last() {
        Some(RuleStep::Emit) => {}
        _ => return Err(CrushError::RuleMissingEmit { rule: name.to_string() }),
    }

    let mut took = false;
    for (i, step) in rule.steps.iter().enumerate() {
        match step {
            RuleStep::Take { .. } => took = true,
            RuleStep::Choose { .. } | RuleStep::Chooseleaf { .. } => {
                if !took {
                    return Err(CrushError::RuleShape {
                        rule: name.to_string(),
                        step: i,
                        message: "choose/chooseleaf before take".into(),
                    });
                }
            }
            RuleStep::SetChooseLocalTries { .. } | RuleStep::SetChooseLocalFallbackTries { .. } => {
                if !tunables.allow_legacy {
                    return Err(CrushError::BackwardCompatTunable {
                        name: format!("{:?}", step),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}
