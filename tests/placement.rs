//! End-to-end scenarios: build a crushmap document, parse it, and exercise
//! mapping, analysis, comparison and optimization through [`crush::Engine`].

use crush::analyze::AnalyzeOptions;
use crush::compare::CompareOptions;
use crush::fixed::Weight;
use crush::optimize::{CancellationToken, OptimizeOptions};
use crush::types::{
    BucketAlgorithm, RawBucket, RawCrushMap, RawDevice, RawItem, Rule, RuleStep, SelectMode,
};
use crush::weights::WeightOverrides;
use crush::Engine;
use std::collections::HashMap;

fn two_host_cluster() -> RawCrushMap {
    let host = |id: i32, name: &str, dev_ids: &[i32]| {
        RawItem::Bucket(RawBucket {
            r#type: "host".into(),
            name: name.into(),
            id: Some(id),
            algorithm: Some(BucketAlgorithm::Straw2),
            weight: None,
            children: dev_ids
                .iter()
                .map(|&d| {
                    RawItem::Device(RawDevice {
                        id: d,
                        name: format!("osd.{d}"),
                        weight: Some(Weight::ONE),
                    })
                })
                .collect(),
        })
    };

    let mut rules = HashMap::new();
    rules.insert(
        "replicated".to_string(),
        Rule {
            steps: vec![
                RuleStep::Take { bucket: "root".into() },
                RuleStep::Chooseleaf { mode: SelectMode::FirstN, num: 0, r#type: "host".into() },
                RuleStep::Emit,
            ],
        },
    );
    rules.insert(
        "indep".to_string(),
        Rule {
            steps: vec![
                RuleStep::Take { bucket: "root".into() },
                RuleStep::Chooseleaf { mode: SelectMode::Indep, num: 0, r#type: "host".into() },
                RuleStep::Emit,
            ],
        },
    );

    RawCrushMap {
        trees: vec![RawItem::Bucket(RawBucket {
            r#type: "root".into(),
            name: "root".into(),
            id: Some(-1),
            algorithm: Some(BucketAlgorithm::Straw2),
            weight: None,
            children: vec![
                host(-2, "host0", &[0, 1]),
                host(-3, "host1", &[2, 3]),
                host(-4, "host2", &[4, 5]),
            ],
        })],
        rules,
        ..Default::default()
    }
}

#[test]
fn s1_deterministic_mapping() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let weights = WeightOverrides::default();
    let a = engine.map_value("replicated", 555, 3, &weights, None).unwrap();
    let b = engine.map_value("replicated", 555, 3, &weights, None).unwrap();
    assert_eq!(a, b);
}

#[test]
fn s2_replicas_land_on_distinct_hosts() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let weights = WeightOverrides::default();
    for value in 0..50u32 {
        let devices = engine.map_value("replicated", value, 3, &weights, None).unwrap();
        assert_eq!(devices.len(), 3);
        let unique: std::collections::HashSet<_> = devices.iter().collect();
        assert_eq!(unique.len(), 3, "replicas collided for value {value}: {devices:?}");
    }
}

#[test]
fn s3_zero_weight_device_excluded_from_every_mapping() {
    let map = two_host_cluster();
    let engine = Engine::parse(&map).unwrap();
    let mut weights = WeightOverrides::default();
    weights.set("osd.0", 0.0, engine.map()).unwrap();
    for value in 0..200u32 {
        let devices = engine.map_value("replicated", value, 3, &weights, None).unwrap();
        assert!(!devices.contains(&0));
    }
}

#[test]
fn s4_indep_mode_preserves_replica_positions_on_shrink() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let weights = WeightOverrides::default();
    // Ask for more replicas than there are hosts; indep mode must pad with
    // ITEM_NONE rather than returning a shorter vector.
    let out = engine.map_value("indep", 1, 5, &weights, None).unwrap();
    assert_eq!(out.len(), 5);
    assert!(out.contains(&crush::mapper::ITEM_NONE));
}

#[test]
fn s5_analyze_reports_every_host_once() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let options = AnalyzeOptions { replication_count: 2, values_count: 500, report_type: Some("host".into()) };
    let reports = engine.analyze("replicated", &options).unwrap();
    assert_eq!(reports.len(), 3);
    for r in &reports {
        assert!(r.objects > 0, "host {} saw no objects", r.name);
    }
}

#[test]
fn s6_compare_identical_maps_reports_no_moves() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let options = CompareOptions { replication_count: 3, values_count: 300, order_matters: false };
    let moves = engine.compare(engine.map(), "replicated", &options).unwrap();
    assert_eq!(moves.total_moved, 0);
}

#[test]
fn optimizer_produces_a_usable_overlay() {
    let mut engine = Engine::parse(&two_host_cluster()).unwrap();
    let options = OptimizeOptions {
        rule_name: "replicated".into(),
        replication_count: 2,
        values_count: 400,
        choose_args_name: "optimized".into(),
        step_budget: u32::MAX,
        multithread: false,
        max_iterations: 10,
        improve_tolerance: 3,
        positions: false,
    };
    let token = CancellationToken::new();
    engine.optimize(&options, &token).unwrap();

    let weights = WeightOverrides::default();
    let out = engine.map_value("replicated", 9, 2, &weights, Some("optimized")).unwrap();
    assert_eq!(out.len(), 2);
}

#[test]
fn unknown_rule_name_is_rejected() {
    let engine = Engine::parse(&two_host_cluster()).unwrap();
    let weights = WeightOverrides::default();
    let err = engine.map_value("no-such-rule", 1, 1, &weights, None).unwrap_err();
    assert!(matches!(err, crush::CrushError::RuleNotFound(_)));
}
