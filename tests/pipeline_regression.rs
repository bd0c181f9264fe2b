//! Pipeline Regression Tests
//!
//! Runs small synthetic races through the full pipeline (normalize, laps,
//! features, inference) and asserts on the shape-independent results.

use mechanical_karma::config::KarmaConfig;
use mechanical_karma::inference::{LoadedModel, LogisticModel, ModelArtifact, ModelRegistry};
use mechanical_karma::ingest::{LapBoundaries, LapWindow, RaceResults, RawTable, TableShape};
use mechanical_karma::pipeline::{DataIntegrityWarning, Diagnostics, PipelineWarning};
use mechanical_karma::{Component, KarmaPipeline, LapAssignment, RiskLevel, SchemaError, SideInputs};

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

const WIDE_CSV: &str = "\
vehicle_id,meta_time,lap,speed,nmot
V1,2024-05-04T14:00:00Z,1,100,5000
V1,2024-05-04T14:00:01Z,1,102,5100
V1,2024-05-04T14:00:02Z,1,101,5200
V1,2024-05-04T14:01:40Z,2,120,6000
V1,2024-05-04T14:01:41Z,2,124,6100
V2,2024-05-04T14:00:00Z,1,90,4800
";

const LONG_CSV: &str = "\
vehicle_id,meta_time,lap,telemetry_name,telemetry_value
V1,2024-05-04T14:00:00Z,1,speed,100
V1,2024-05-04T14:00:00Z,1,nmot,5000
V1,2024-05-04T14:00:01Z,1,nmot,5100
V1,2024-05-04T14:00:01Z,1,speed,102
V1,2024-05-04T14:00:02Z,1,speed,101
V1,2024-05-04T14:00:02Z,1,nmot,5200
V1,2024-05-04T14:01:40Z,2,speed,120
V1,2024-05-04T14:01:40Z,2,nmot,6000
V1,2024-05-04T14:01:41Z,2,speed,124
V1,2024-05-04T14:01:41Z,2,nmot,6100
V2,2024-05-04T14:00:00Z,1,speed,90
V2,2024-05-04T14:00:00Z,1,nmot,4800
";

fn table(csv: &str) -> RawTable {
    RawTable::from_bytes(csv.as_bytes()).expect("fixture CSV should parse")
}

fn logistic(features: &[(&str, f64)], intercept: f64) -> LogisticModel {
    LogisticModel {
        features: features.iter().map(|(f, _)| f.to_string()).collect(),
        defaults: BTreeMap::new(),
        coefficients: features.iter().map(|(_, w)| *w).collect(),
        intercept,
    }
}

fn loaded(name: &str, model: LogisticModel) -> LoadedModel {
    LoadedModel::new(name, ModelArtifact::Logistic(model), None).expect("valid test model")
}

/// Overall model plus engine and brakes component models.
fn full_registry() -> ModelRegistry {
    ModelRegistry::empty()
        .with_overall(loaded("overall", logistic(&[("speed_mean", 0.05)], -6.0)))
        .with_component(Component::Engine, loaded("engine", logistic(&[("nmot_max", 0.001)], -6.0)))
        .with_component(Component::Brakes, loaded("brakes", logistic(&[("speed_max", 0.01)], -1.0)))
}

// ============================================================================
// Shape invariance
// ============================================================================

#[test]
fn long_and_wide_layouts_produce_identical_features() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let pipeline = KarmaPipeline::new(&config, &registry);

    let wide = pipeline.process(&table(WIDE_CSV), SideInputs::default()).expect("wide");
    let long = pipeline.process(&table(LONG_CSV), SideInputs::default()).expect("long");

    assert_eq!(wide.shape, Some(TableShape::Wide));
    assert_eq!(long.shape, Some(TableShape::Long));
    assert_eq!(wide.features, long.features);
    assert_eq!(wide.features.len(), 3);
}

#[test]
fn v1_lap_one_aggregates_match_hand_computation() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    let lap1 = race.features_for("V1", Some(1));
    assert_eq!(lap1.len(), 1);
    let v = lap1[0];
    assert_eq!(v.samples_per_lap, 3);
    assert!((v.get("speed_mean").unwrap() - 101.0).abs() < 1e-9);
    assert!((v.get("speed_std").unwrap() - 1.0).abs() < 1e-9);
    assert!((v.get("speed_max").unwrap() - 102.0).abs() < 1e-9);
    assert!((v.get("speed_min").unwrap() - 100.0).abs() < 1e-9);
    assert!((v.lap_duration_s().unwrap() - 2.0).abs() < 1e-9);
    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::Explicit));
}

#[test]
fn single_sample_lap_has_zero_std() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    let v2 = race.features_for("V2", None);
    assert_eq!(v2.len(), 1);
    assert_eq!(v2[0].samples_per_lap, 1);
    assert_eq!(v2[0].get("speed_std"), Some(0.0));
    assert_eq!(v2[0].get("speed_mean"), Some(90.0));
}

#[test]
fn output_is_sorted_by_vehicle_then_lap() {
    let shuffled = "\
vehicle_id,meta_time,lap,speed
V2,2024-05-04T14:00:05Z,2,91
V1,2024-05-04T14:00:03Z,3,103
V2,2024-05-04T14:00:00Z,1,90
V1,2024-05-04T14:00:00Z,1,100
V1,2024-05-04T14:00:01Z,2,101
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(shuffled), SideInputs::default())
        .expect("process");

    let keys: Vec<(&str, u32)> = race
        .features
        .iter()
        .map(|f| (f.vehicle_id.as_str(), f.lap))
        .collect();
    assert_eq!(keys, vec![("V1", 1), ("V1", 2), ("V1", 3), ("V2", 1), ("V2", 2)]);
    let pred_keys: Vec<(&str, u32)> = race
        .predictions
        .iter()
        .map(|p| (p.vehicle_id.as_str(), p.lap))
        .collect();
    assert_eq!(pred_keys, keys);
}

// ============================================================================
// Lap strategies
// ============================================================================

#[test]
fn fixed_window_laps_are_flagged_approximate() {
    let no_laps = "\
vehicle_id,meta_time,speed
V1,2024-05-04T14:00:00Z,100
V1,2024-05-04T14:01:00Z,101
V1,2024-05-04T14:01:40Z,130
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(no_laps), SideInputs::default())
        .expect("process");

    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::FixedWindow));
    let laps: Vec<u32> = race.features.iter().map(|f| f.lap).collect();
    assert_eq!(laps, vec![1, 2]);
    assert!(race.diagnostics.data_integrity().any(|w| matches!(
        w,
        DataIntegrityWarning::ApproximateLaps { vehicle_id, .. } if vehicle_id == "V1"
    )));
}

#[test]
fn boundary_markers_assign_laps_from_timestamps() {
    let no_laps = "\
vehicle_id,meta_time,speed
V1,2024-05-04T14:00:10Z,100
V1,2024-05-04T14:00:50Z,110
V1,2024-05-04T14:01:10Z,120
";
    let t = |s: u32| Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap() + chrono::Duration::seconds(i64::from(s));
    let boundaries = LapBoundaries::from_windows([
        ("V1".to_string(), LapWindow { lap: 1, start: t(0), end: t(60) }),
        ("V1".to_string(), LapWindow { lap: 2, start: t(60), end: t(120) }),
    ]);

    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(
            &table(no_laps),
            SideInputs {
                boundaries: Some(&boundaries),
                results: None,
            },
        )
        .expect("process");

    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::Boundaries));
    let lap1 = race.features_for("V1", Some(1));
    assert_eq!(lap1[0].samples_per_lap, 2);
    assert_eq!(race.features_for("V1", None).len(), 2);
}

#[test]
fn partial_lap_column_falls_back_to_derived_laps() {
    let csv = "\
vehicle_id,meta_time,lap,speed
V1,2024-05-04T14:00:00Z,5,100
V1,2024-05-04T14:00:30Z,,110
V1,2024-05-04T14:01:40Z,5,130
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(csv), SideInputs::default())
        .expect("process");

    assert!(race.diagnostics.data_integrity().any(|w| matches!(
        w,
        DataIntegrityWarning::PartialLapColumn { column, missing: 1 } if column == "lap"
    )));
    // Labels are ignored; 90 s windows from the first sample
    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::FixedWindow));
    let laps: Vec<(u32, usize)> = race.features.iter().map(|f| (f.lap, f.samples_per_lap)).collect();
    assert_eq!(laps, vec![(1, 2), (2, 1)]);
}

#[test]
fn out_of_order_lap_labels_are_kept_with_warning() {
    let csv = "\
vehicle_id,meta_time,lap,speed
V1,2024-05-04T14:00:00Z,2,100
V1,2024-05-04T14:00:10Z,1,110
V1,2024-05-04T14:00:20Z,2,120
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(csv), SideInputs::default())
        .expect("process");

    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::Explicit));
    let warning = race
        .diagnostics
        .data_integrity()
        .find(|w| matches!(w, DataIntegrityWarning::OutOfOrderLaps { .. }))
        .expect("out-of-order warning");
    assert!(matches!(warning, DataIntegrityWarning::OutOfOrderLaps { count: 1, .. }));
    assert!(warning.to_string().contains("labels kept as recorded"));

    let lap1 = race.features_for("V1", Some(1));
    assert_eq!(lap1.len(), 1);
    assert_eq!(lap1[0].samples_per_lap, 1);
    assert_eq!(lap1[0].get("speed_mean"), Some(110.0));
    let all = race.features_for("V1", None);
    let lap2 = all[1];
    assert_eq!(lap2.lap, 2);
    assert_eq!(lap2.samples_per_lap, 2);
    assert_eq!(lap2.get("speed_mean"), Some(110.0));
}

#[test]
fn inverted_boundary_window_is_skipped() {
    let starts = table(
        "vehicle_id,lap,timestamp\n\
         V1,1,2024-05-04T14:00:00Z\n\
         V1,2,2024-05-04T14:01:00Z\n",
    );
    let ends = table(
        "vehicle_id,lap,timestamp\n\
         V1,1,2024-05-04T14:01:00Z\n\
         V1,2,2024-05-04T14:00:30Z\n",
    );
    let mut boundary_diag = Diagnostics::new();
    let boundaries =
        LapBoundaries::from_tables(&starts, &ends, "vehicle_id", &mut boundary_diag).expect("boundaries");

    assert_eq!(boundaries.lap_count(), 1);
    assert_eq!(boundary_diag.len(), 1);
    assert!(matches!(
        boundary_diag.data_integrity().next(),
        Some(DataIntegrityWarning::MalformedBoundary { lap: 2, vehicle_id, .. }) if vehicle_id == "V1"
    ));

    let no_laps = "\
vehicle_id,meta_time,speed
V1,2024-05-04T14:00:10Z,100
V1,2024-05-04T14:00:50Z,110
V1,2024-05-04T14:01:10Z,120
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(
            &table(no_laps),
            SideInputs {
                boundaries: Some(&boundaries),
                results: None,
            },
        )
        .expect("process");

    assert_eq!(race.lap_assignment.get("V1"), Some(&LapAssignment::Boundaries));
    let laps: Vec<(u32, usize)> = race.features.iter().map(|f| (f.lap, f.samples_per_lap)).collect();
    assert_eq!(laps, vec![(1, 2)]);
    assert!(race.diagnostics.data_integrity().any(|w| matches!(
        w,
        DataIntegrityWarning::OutsideLapBoundaries { dropped: 1, .. }
    )));
}

// ============================================================================
// Race results
// ============================================================================

const NUMBERED_CSV: &str = "\
vehicle_id,vehicle_number,meta_time,lap,speed
GR86-002-13,13,2024-05-04T14:00:00Z,1,100
GR86-002-13,13,2024-05-04T14:00:01Z,1,102
GR86-004-7,7,2024-05-04T14:00:00Z,1,95
";

#[test]
fn results_keyed_by_car_number_match_telemetry_vehicle_ids() {
    let results = RaceResults::from_table(&table("POS;NUMBER;STATUS\n2;13;DNF\n"), "vehicle_id").expect("results");

    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(
            &table(NUMBERED_CSV),
            SideInputs {
                boundaries: None,
                results: Some(&results),
            },
        )
        .expect("process");

    assert_eq!(race.dnf.get("GR86-002-13"), Some(&true));
    assert_eq!(race.dnf.get("GR86-004-7"), None);
    assert_eq!(race.vehicle_numbers.get("GR86-002-13").map(String::as_str), Some("13"));
    // The number column is bookkeeping, not a signal
    assert!(race.features.iter().all(|f| f.features.keys().all(|k| !k.starts_with("vehicle_number"))));
}

#[test]
fn results_fall_back_to_vehicle_id_suffix() {
    let no_number_column = "\
vehicle_id,meta_time,lap,speed
GR86-002-13,2024-05-04T14:00:00Z,1,100
GR86-004-7,2024-05-04T14:00:00Z,1,95
";
    let results = RaceResults::from_table(
        &table("POS;NUMBER;STATUS\n1;7;Classified\n2;13;DNF\n"),
        "vehicle_id",
    )
    .expect("results");

    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(
            &table(no_number_column),
            SideInputs {
                boundaries: None,
                results: Some(&results),
            },
        )
        .expect("process");

    assert_eq!(race.dnf.get("GR86-002-13"), Some(&true));
    assert_eq!(race.dnf.get("GR86-004-7"), Some(&false));
}

#[test]
fn results_table_sets_dnf_flag() {
    let results = table("vehicle_id,STATUS\nV1,DNF\nV2,Classified\n");
    let results = RaceResults::from_table(&results, "vehicle_id").expect("results");

    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(
            &table(WIDE_CSV),
            SideInputs {
                boundaries: None,
                results: Some(&results),
            },
        )
        .expect("process");

    assert_eq!(race.dnf.get("V1"), Some(&true));
    assert_eq!(race.dnf.get("V2"), Some(&false));
}

// ============================================================================
// Inference
// ============================================================================

#[test]
fn overall_model_without_component_models() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty().with_overall(loaded("overall", logistic(&[("speed_mean", 0.05)], -6.0)));
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    for p in &race.predictions {
        let dnf = p.dnf_probability.expect("overall model is loaded");
        assert!((0.0..=1.0).contains(&dnf));
        assert!(p.risk_level.is_some());
        assert!(p.component_predictions.is_empty());
        assert!(p.most_at_risk_component.is_none());
    }
    // sigmoid(0.05 * 101 - 6) = sigmoid(-0.95)
    let first = &race.predictions[0];
    let expected = 1.0 / (1.0 + 0.95_f64.exp());
    assert!((first.dnf_probability.unwrap() - expected).abs() < 1e-9);
    assert_eq!(first.risk_level, Some(RiskLevel::Low));
}

#[test]
fn most_at_risk_component_is_highest_material_probability() {
    let config = KarmaConfig::default();
    let registry = full_registry();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    let p = &race.predictions[0];
    let brakes = p.component(Component::Brakes).unwrap();
    let engine = p.component(Component::Engine).unwrap();
    assert!(brakes > engine);
    let top = p.most_at_risk_component.expect("brakes risk is material");
    assert_eq!(top.component, Component::Brakes);
    assert!((top.probability - brakes).abs() < 1e-12);
    assert_eq!(p.component(Component::Tires), None);
}

#[test]
fn tied_components_report_the_first_in_order() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty()
        .with_component(Component::Brakes, loaded("brakes", logistic(&[("speed_mean", 0.0)], -1.0)))
        .with_component(Component::Engine, loaded("engine", logistic(&[("speed_mean", 0.0)], -1.0)));
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    for p in &race.predictions {
        assert_eq!(p.component(Component::Engine), p.component(Component::Brakes));
        let top = p.most_at_risk_component.expect("tied risk is material");
        assert_eq!(top.component, Component::Engine);
    }
}

#[test]
fn risk_at_materiality_threshold_is_not_reported() {
    let intercept = -1.0_f64;
    let probability = 1.0 / (1.0 + (-intercept).exp());
    let registry = ModelRegistry::empty()
        .with_component(Component::Gearbox, loaded("gearbox", logistic(&[("speed_mean", 0.0)], intercept)));

    let mut config = KarmaConfig::default();
    config.inference.materiality_threshold = probability;
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");
    for p in &race.predictions {
        assert_eq!(p.component(Component::Gearbox), Some(probability));
        assert!(p.most_at_risk_component.is_none());
    }

    config.inference.materiality_threshold = probability - 1e-9;
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");
    for p in &race.predictions {
        let top = p.most_at_risk_component.expect("just above threshold");
        assert_eq!(top.component, Component::Gearbox);
    }
}

#[test]
fn missing_model_feature_is_reported_once() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty().with_overall(loaded(
        "overall",
        logistic(&[("speed_mean", 0.05), ("tire_temp_mean", 0.1)], -6.0),
    ));
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(WIDE_CSV), SideInputs::default())
        .expect("process");

    assert!(race.predictions.iter().all(|p| p.dnf_probability.is_some()));
    let mismatches: Vec<_> = race
        .diagnostics
        .iter()
        .filter(|w| matches!(w, PipelineWarning::FeatureMismatch { .. }))
        .collect();
    assert_eq!(mismatches.len(), 1);
    match mismatches[0] {
        PipelineWarning::FeatureMismatch { missing, laps, .. } => {
            assert_eq!(missing, &vec!["tire_temp_mean".to_string()]);
            assert_eq!(*laps, 3);
        }
        _ => unreachable!(),
    }
}

// ============================================================================
// Schema errors
// ============================================================================

#[test]
fn missing_vehicle_column_is_a_schema_error() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let err = KarmaPipeline::new(&config, &registry)
        .process(&table("car,meta_time,speed\nV1,2024-05-04T14:00:00Z,100\n"), SideInputs::default())
        .unwrap_err();
    assert!(matches!(err, SchemaError::MissingVehicleColumn { .. }));
}

#[test]
fn no_timestamp_and_no_lap_is_a_schema_error() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let err = KarmaPipeline::new(&config, &registry)
        .process(&table("vehicle_id,speed\nV1,100\n"), SideInputs::default())
        .unwrap_err();
    assert!(matches!(err, SchemaError::NoTimestampOrLap { .. }));
}

#[test]
fn unknown_signals_only_is_a_schema_error() {
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let err = KarmaPipeline::new(&config, &registry)
        .process(&table("vehicle_id,lap,oil_temp\nV1,1,90\n"), SideInputs::default())
        .unwrap_err();
    assert!(matches!(err, SchemaError::NoSignalLayout { .. }));
}

#[test]
fn bad_timestamps_are_dropped_with_warning() {
    let csv = "\
vehicle_id,meta_time,lap,speed
V1,2024-05-04T14:00:00Z,1,100
V1,not-a-time,1,500
V1,2024-05-04T14:00:01Z,1,102
";
    let config = KarmaConfig::default();
    let registry = ModelRegistry::empty();
    let race = KarmaPipeline::new(&config, &registry)
        .process(&table(csv), SideInputs::default())
        .expect("process");

    assert_eq!(race.features[0].samples_per_lap, 2);
    assert_eq!(race.features[0].get("speed_max"), Some(102.0));
    assert!(race.diagnostics.data_integrity().any(|w| matches!(
        w,
        DataIntegrityWarning::UnparsableTimestamps { dropped: 1, .. }
    )));
}
