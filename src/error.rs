//! Structured errors for the placement engine.
//!
//! Parse-time errors abort (`Schema`, `DanglingReference`/`CyclicReference`,
//! `RuleShape`, `BackwardCompat*`, `OverlayShape`). Runtime mapping never
//! fails hard — retry exhaustion is semantic (null slots / shorter lists),
//! not an error — but the analyzer surfaces it as `BadMapping` when a
//! simulated mapping comes back short.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrushError {
    #[error("schema error at {location}: {message}")]
    Schema { location: String, message: String },

    #[error("reference at {location} has no target named {target:?}")]
    DanglingReference { location: String, target: String },

    #[error("cyclic reference detected through {location}")]
    CyclicReference { location: String },

    #[error("rule {rule:?} step {step}: {message}")]
    RuleShape {
        rule: String,
        step: usize,
        message: String,
    },

    #[error("rule {rule:?} does not end with emit")]
    RuleMissingEmit { rule: String },

    #[error("bucket algorithm {algorithm:?} requires backward-compatibility opt-in")]
    BackwardCompatAlgorithm { algorithm: String },

    #[error("legacy tunable/step {name:?} requires backward-compatibility opt-in")]
    BackwardCompatTunable { name: String },

    #[error("overlay {name:?} bucket {bucket_id}: {message}")]
    OverlayShape {
        name: String,
        bucket_id: i32,
        message: String,
    },

    #[error("duplicate id {id} (first seen at {first}, again at {second})")]
    DuplicateId { id: i32, first: String, second: String },

    #[error("duplicate name {name:?} (first seen at {first}, again at {second})")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },

    #[error("bucket {0} not found")]
    BucketNotFound(i32),

    #[error("device {0} not found")]
    DeviceNotFound(i32),

    #[error("item named {0:?} not found")]
    ItemNotFound(String),

    #[error("rule {0:?} not found")]
    RuleNotFound(String),

    #[error("unknown type {0:?} referenced by a rule step")]
    UnknownType(String),

    #[error("choose_args {0:?} not found")]
    ChooseArgsNotFound(String),

    #[error("device {0:?} named in weights override does not exist")]
    UnknownWeightOverride(String),

    #[error("mapping for value {value} returned {got} of {want} requested devices")]
    BadMapping { value: u32, got: usize, want: usize },
}

pub type Result<T> = std::result::Result<T, CrushError>;
