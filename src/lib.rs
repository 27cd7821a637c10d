//! A pseudo-random, weighted, hierarchical placement engine.
//!
//! Maps an input value to a deterministic set of leaf devices by walking a
//! weighted tree of buckets according to a named rule program — the same
//! shape of problem Ceph's CRUSH algorithm solves. [`Engine`] is the
//! intended entry point; the individual modules are public for callers that
//! want to work with a [`CrushMap`] directly (the analyzer and optimizer
//! both do).

pub mod analyze;
pub mod bucket;
pub mod compare;
pub mod error;
pub mod filter;
pub mod fixed;
pub mod hash;
pub mod mapper;
pub mod optimize;
pub mod overlay;
pub mod parse;
pub mod types;
pub mod weights;

pub use error::{CrushError, Result};
pub use types::{CrushMap, Item, ItemId, RawCrushMap};

use weights::WeightOverrides;

/// The programmatic surface: parse once, then map/analyze/compare/optimize
/// against the normalized map.
pub struct Engine {
    map: CrushMap,
}

impl Engine {
    /// Normalize a raw document into a [`CrushMap`], resolving references
    /// and validating ids, names and rule shapes.
    pub fn parse(raw: &RawCrushMap) -> Result<Self> {
        Ok(Engine { map: parse::normalize(raw)? })
    }

    pub fn from_map(map: CrushMap) -> Self {
        Engine { map }
    }

    pub fn map(&self) -> &CrushMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut CrushMap {
        &mut self.map
    }

    /// Map `value` through `rule_name`, requesting `replication_count`
    /// items, under an optional named `choose_args` overlay and ephemeral
    /// weight overrides.
    pub fn map_value(
        &self,
        rule_name: &str,
        value: u32,
        replication_count: usize,
        weights: &WeightOverrides,
        choose_args_name: Option<&str>,
    ) -> Result<Vec<ItemId>> {
        mapper::map_rule(&self.map, rule_name, value, replication_count, weights, choose_args_name)
    }

    pub fn analyze(
        &self,
        rule_name: &str,
        options: &analyze::AnalyzeOptions,
    ) -> Result<Vec<analyze::ItemReport>> {
        analyze::analyze(&self.map, rule_name, options)
    }

    pub fn worst_case_failure_domain(
        &self,
        rule_name: &str,
        options: &analyze::AnalyzeOptions,
    ) -> Result<std::collections::HashMap<String, f64>> {
        analyze::worst_case_failure_domain(&self.map, rule_name, options)
    }

    pub fn compare(
        &self,
        after: &CrushMap,
        rule_name: &str,
        options: &compare::CompareOptions,
    ) -> Result<compare::BucketMoves> {
        compare::compare(&self.map, after, rule_name, options)
    }

    pub fn optimize(
        &mut self,
        options: &optimize::OptimizeOptions,
        token: &optimize::CancellationToken,
    ) -> Result<()> {
        optimize::run(&mut self.map, options, token)
    }

    pub fn forecast_optimize(
        &self,
        options: &optimize::OptimizeOptions,
        token: &optimize::CancellationToken,
    ) -> Result<std::collections::HashMap<ItemId, u32>> {
        optimize::forecast(&self.map, options, token)
    }
}
