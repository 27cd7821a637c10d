//! The normalized crushmap data model.
//!
//! External callers hand the engine a document shaped like [`RawItem`]
//! trees plus rules/tunables/choose_args; [`crate::parse::normalize`] turns
//! that into the DAG-free [`CrushMap`] the mapper actually walks. Device vs.
//! bucket vs. reference is duck-typed at the external boundary (distinguished
//! by which fields are present) and re-expressed here as a tagged [`RawItem`]
//! enum, matching the design note that duck-typed child polymorphism must
//! become a tagged variant with three cases.

use crate::fixed::Weight;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ItemId = i32;

/// Selection algorithm for a bucket's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketAlgorithm {
    Uniform,
    List,
    /// Legacy; rejected at parse unless [`Tunables::allow_legacy`] is set.
    Straw,
    Straw2,
}

impl Default for BucketAlgorithm {
    fn default() -> Self {
        BucketAlgorithm::Straw2
    }
}

/// Ordering semantics for `choose`/`chooseleaf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    FirstN,
    Indep,
}

/// One step of a rule program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleStep {
    Take { bucket: String },
    SetChooseTries { n: u32 },
    SetChooseleafTries { n: u32 },
    Choose { mode: SelectMode, num: i32, r#type: String },
    Chooseleaf { mode: SelectMode, num: i32, r#type: String },
    /// Legacy tunables steps; rejected unless [`Tunables::allow_legacy`].
    SetChooseLocalTries { n: u32 },
    SetChooseLocalFallbackTries { n: u32 },
    Emit,
}

/// A named, ordered rule program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub steps: Vec<RuleStep>,
}

/// Tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub choose_total_tries: u32,
    /// Opt-in for `straw`, and for the `set_choose_local_tries` family of
    /// legacy steps.
    pub allow_legacy: bool,
    pub choose_local_tries: Option<u32>,
    pub choose_local_fallback_tries: Option<u32>,
    pub chooseleaf_vary_r: Option<bool>,
    pub chooseleaf_stable: Option<bool>,
    pub chooseleaf_descend_once: Option<bool>,
    pub straw_calc_version: Option<u32>,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            choose_total_tries: 50,
            allow_legacy: false,
            choose_local_tries: None,
            choose_local_fallback_tries: None,
            chooseleaf_vary_r: None,
            chooseleaf_stable: None,
            chooseleaf_descend_once: None,
            straw_calc_version: None,
        }
    }
}

/// A per-bucket `choose_args` overlay entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooseArgsEntry {
    pub bucket_id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<ItemId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_set: Option<Vec<Vec<Weight>>>,
}

impl ChooseArgsEntry {
    pub fn new(bucket_id: ItemId) -> Self {
        ChooseArgsEntry { bucket_id, ids: None, weight_set: None }
    }

    /// The per-position weight row to use for `position`, falling back to
    /// the last available row.
    pub fn weight_row(&self, position: usize) -> Option<&[Weight]> {
        let rows = self.weight_set.as_ref()?;
        if rows.is_empty() {
            return None;
        }
        let idx = position.min(rows.len() - 1);
        Some(&rows[idx])
    }
}

/// A leaf storage device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: ItemId,
    pub name: String,
    #[serde(default = "Weight::default_one")]
    pub weight: Weight,
}

impl Weight {
    pub(crate) fn default_one() -> Weight {
        Weight::ONE
    }
}

/// An internal hierarchy node. In the normalized [`CrushMap`] this
/// never contains a reference — references are resolved by
/// [`crate::parse::normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: ItemId,
    pub name: String,
    pub r#type: String,
    #[serde(default)]
    pub algorithm: BucketAlgorithm,
    pub weight: Weight,
    pub children: Vec<Item>,
    /// Merged-form `choose_args`, keyed by overlay name. Empty in the
    /// canonical split form stored on [`CrushMap::choose_args`]; populated
    /// transiently by [`crate::overlay::merge`].
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub choose_args: HashMap<String, ChooseArgsEntry>,
}

/// A normalized tree item: device or bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Item {
    Bucket(Bucket),
    Device(Device),
}

impl Item {
    pub fn id(&self) -> ItemId {
        match self {
            Item::Bucket(b) => b.id,
            Item::Device(d) => d.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Item::Bucket(b) => &b.name,
            Item::Device(d) => &d.name,
        }
    }

    pub fn weight(&self) -> Weight {
        match self {
            Item::Bucket(b) => b.weight,
            Item::Device(d) => d.weight,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Item::Bucket(b) => &b.r#type,
            Item::Device(_) => "device",
        }
    }

    pub fn as_bucket(&self) -> Option<&Bucket> {
        match self {
            Item::Bucket(b) => Some(b),
            Item::Device(_) => None,
        }
    }

    pub fn as_bucket_mut(&mut self) -> Option<&mut Bucket> {
        match self {
            Item::Bucket(b) => Some(b),
            Item::Device(_) => None,
        }
    }
}

/// A reference to an existing item, optionally overriding its weight.
/// Only appears in the raw, pre-normalization document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Weight>,
}

/// A raw bucket as accepted at the external boundary, before reference
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBucket {
    pub r#type: String,
    pub name: String,
    #[serde(default)]
    pub id: Option<ItemId>,
    #[serde(default)]
    pub algorithm: Option<BucketAlgorithm>,
    #[serde(default)]
    pub weight: Option<Weight>,
    #[serde(default)]
    pub children: Vec<RawItem>,
}

/// A raw device as accepted at the external boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDevice {
    pub id: ItemId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Weight>,
}

/// Duck-typed child: device, bucket, or reference, told apart by which
/// fields are present. `Reference` must be tried first since
/// `reference_id` is its only required, distinguishing field —
/// `serde(untagged)` tries variants in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawItem {
    Reference(Reference),
    Bucket(RawBucket),
    Device(RawDevice),
}

/// The normalized crushmap the mapper, analyzer, comparator and optimizer
/// all operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrushMap {
    pub trees: Vec<Item>,
    pub rules: HashMap<String, Rule>,
    pub tunables: Tunables,
    /// Canonical split-form overlay storage: name -> per-bucket entries.
    pub choose_args: HashMap<String, Vec<ChooseArgsEntry>>,
}

impl Default for CrushMap {
    fn default() -> Self {
        CrushMap {
            trees: Vec::new(),
            rules: HashMap::new(),
            tunables: Tunables::default(),
            choose_args: HashMap::new(),
        }
    }
}

/// The raw, pre-normalization document shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCrushMap {
    pub trees: Vec<RawItem>,
    pub rules: HashMap<String, Rule>,
    pub tunables: Tunables,
    pub choose_args: HashMap<String, Vec<ChooseArgsEntry>>,
}
