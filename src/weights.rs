//! Ephemeral per-call weight overrides.
//!
//! A caller can scale specific devices down for one mapping/analysis call
//! without editing the crushmap itself — e.g. to simulate an OSD being
//! partially out, or to exclude it entirely with a factor of `0`. Overrides
//! are named by device name and resolved to ids against a particular
//! [`CrushMap`] when set, so a typo is caught immediately rather than
//! silently ignored during mapping.

use crate::error::{CrushError, Result};
use crate::types::{CrushMap, Item, ItemId};
use std::collections::HashMap;

/// A `[0, 1]` multiplier per device id, defaulting to `1.0` for any device
/// not present in the map.
#[derive(Debug, Clone, Default)]
pub struct WeightOverrides {
    factors: HashMap<ItemId, f64>,
}

impl WeightOverrides {
    pub fn new() -> Self {
        WeightOverrides::default()
    }

    /// Build overrides from a flat `name -> factor` dump, validating every
    /// name against `map`. Accepts the "foreign dump" convention where any
    /// value below `1.0` is treated as an override and `1.0`/absent means
    /// "no change".
    pub fn from_named(named: &HashMap<String, f64>, map: &CrushMap) -> Result<Self> {
        let mut overrides = WeightOverrides::default();
        for (name, factor) in named {
            overrides.set(name, *factor, map)?;
        }
        Ok(overrides)
    }

    /// Set the override for the device named `name`, looking it up in
    /// `map`. Errors if no such device exists.
    pub fn set(&mut self, name: &str, factor: f64, map: &CrushMap) -> Result<()> {
        let id = find_device_id(map, name)
            .ok_or_else(|| CrushError::UnknownWeightOverride(name.to_string()))?;
        self.factors.insert(id, factor.clamp(0.0, 1.0));
        Ok(())
    }

    /// The effective multiplier for `id`, `1.0` if unset.
    pub fn factor(&self, id: ItemId) -> f64 {
        self.factors.get(&id).copied().unwrap_or(1.0)
    }
}

fn find_device_id(map: &CrushMap, name: &str) -> Option<ItemId> {
    fn walk(item: &Item, name: &str) -> Option<ItemId> {
        match item {
            Item::Device(d) if d.name == name => Some(d.id),
            Item::Device(_) => None,
            Item::Bucket(b) => b.children.iter().find_map(|c| walk(c, name)),
        }
    }
    map.trees.iter().find_map(|t| walk(t, name))
}
