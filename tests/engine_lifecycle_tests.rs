//! End-to-end engine tests
//!
//! Drives the public `ExperimentEngine` surface through full experiment
//! lifecycles:
//! - test creation and draft-only configuration
//! - lifecycle gating of assignment and events
//! - deterministic, idempotent assignment
//! - conversion accounting and analysis snapshots

use std::collections::HashSet;

use shodh_experiments::errors::ExperimentError;
use shodh_experiments::experiment::{AnalysisStatus, ExperimentStore, TestConfigUpdate};
use shodh_experiments::{
    ABTest, EngineConfig, EventType, ExperimentEngine, Identity, NewTest, TestStatus, VariantId,
    VariantSpec,
};

// ============================================================================
// TEST INFRASTRUCTURE
// ============================================================================

fn engine() -> ExperimentEngine {
    ExperimentEngine::in_memory(EngineConfig::default())
}

fn two_arm(name: &str) -> NewTest {
    NewTest::new(
        name,
        vec![
            VariantSpec::control("control", 50.0),
            VariantSpec::treatment("treatment", 50.0),
        ],
    )
}

fn running_test(engine: &ExperimentEngine, spec: NewTest) -> ABTest {
    let test = engine.create_test(spec).expect("create test");
    engine.start_test(&test.id).expect("start test")
}

/// Bind `n` fresh participants to `variant_id` and convert the first `conversions`
fn seed_variant(
    engine: &ExperimentEngine,
    test: &ABTest,
    variant_id: VariantId,
    prefix: &str,
    n: u64,
    conversions: u64,
) {
    for i in 0..n {
        let identity = Identity::user(format!("{prefix}-{i}"));
        let participant = engine
            .store()
            .get_or_create_participant(&test.id, &identity, &variant_id, TestStatus::ASSIGNABLE)
            .expect("seed participant")
            .into_participant();

        if i < conversions {
            engine
                .record_event(
                    &participant.id,
                    &variant_id,
                    &test.id,
                    EventType::Conversion,
                    Some(10.0),
                )
                .expect("record conversion");
        }
    }
}

// ============================================================================
// CREATION AND CONFIGURATION
// ============================================================================

#[test]
fn test_created_test_is_draft_with_defaults() {
    let engine = engine();
    let test = engine.create_test(two_arm("defaults")).unwrap();

    assert_eq!(test.status, TestStatus::Draft);
    assert_eq!(test.traffic_allocation, 100.0);
    assert_eq!(test.confidence_level, 95.0);
    assert!(test.started_at.is_none());
    assert_eq!(test.variants.len(), 2);
    assert_eq!(test.variants.iter().filter(|v| v.is_control).count(), 1);

    let fetched = engine.get_test(&test.id).unwrap();
    assert_eq!(fetched.id, test.id);
}

#[test]
fn test_create_rejects_percentages_not_summing_to_100() {
    let engine = engine();
    let spec = NewTest::new(
        "bad-split",
        vec![
            VariantSpec::control("control", 50.0),
            VariantSpec::treatment("treatment", 40.0),
        ],
    );

    let err = engine.create_test(spec).unwrap_err();
    assert!(matches!(err, ExperimentError::Configuration(_)));
    assert!(engine.list_tests().unwrap().is_empty());
}

#[test]
fn test_create_rejects_missing_control() {
    let engine = engine();
    let spec = NewTest::new(
        "no-control",
        vec![
            VariantSpec::treatment("a", 50.0),
            VariantSpec::treatment("b", 50.0),
        ],
    );
    assert!(matches!(
        engine.create_test(spec),
        Err(ExperimentError::Configuration(_))
    ));
}

#[test]
fn test_create_rejects_out_of_range_confidence() {
    let engine = engine();
    let err = engine
        .create_test(two_arm("confidence").with_confidence_level(100.0))
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[test]
fn test_configuration_is_mutable_only_in_draft() {
    let engine = engine();
    let test = engine.create_test(two_arm("mutable")).unwrap();

    let updated = engine
        .update_test_config(
            &test.id,
            TestConfigUpdate {
                traffic_allocation: Some(25.0),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.traffic_allocation, 25.0);

    engine.start_test(&test.id).unwrap();
    let err = engine
        .update_test_config(
            &test.id,
            TestConfigUpdate {
                traffic_allocation: Some(75.0),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ExperimentError::TestNotActive { .. }));
    assert_eq!(engine.get_test(&test.id).unwrap().traffic_allocation, 25.0);
}

#[test]
fn test_unknown_test_is_not_found() {
    let engine = engine();
    let missing = shodh_experiments::TestId::new();
    assert!(matches!(
        engine.get_test(&missing),
        Err(ExperimentError::TestNotFound(_))
    ));
    assert!(matches!(
        engine.decide_and_assign(&missing, &Identity::user("u")),
        Err(ExperimentError::TestNotFound(_))
    ));
}

#[test]
fn test_resolve_test_by_textual_id() {
    let engine = engine();
    let test = engine.create_test(two_arm("textual")).unwrap();

    assert_eq!(engine.resolve_test(&test.id.to_string()).unwrap().id, test.id);
    assert_eq!(
        engine.resolve_test("not-a-uuid").unwrap_err().code(),
        "INVALID_INPUT"
    );
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_full_lifecycle_stamps_timestamps() {
    let engine = engine();
    let test = engine.create_test(two_arm("lifecycle")).unwrap();

    let running = engine.start_test(&test.id).unwrap();
    let started_at = running.started_at.expect("started_at stamped");

    let paused = engine.pause_test(&test.id).unwrap();
    assert_eq!(paused.status, TestStatus::Paused);

    let resumed = engine.start_test(&test.id).unwrap();
    assert_eq!(resumed.started_at, Some(started_at));

    let completed = engine.complete_test(&test.id).unwrap();
    assert_eq!(completed.status, TestStatus::Completed);
    assert!(completed.ended_at.is_some());
}

#[test]
fn test_disallowed_transition_changes_nothing() {
    let engine = engine();
    let test = engine.create_test(two_arm("blocked")).unwrap();

    let err = engine.complete_test(&test.id).unwrap_err();
    assert_eq!(
        err,
        ExperimentError::InvalidStateTransition {
            from: TestStatus::Draft,
            to: TestStatus::Completed,
        }
    );
    assert_eq!(engine.get_test(&test.id).unwrap().status, TestStatus::Draft);

    engine.cancel_test(&test.id).unwrap();
    assert!(matches!(
        engine.start_test(&test.id),
        Err(ExperimentError::InvalidStateTransition { .. })
    ));
}

#[test]
fn test_assignment_requires_running_test() {
    let engine = engine();
    let test = engine.create_test(two_arm("gated")).unwrap();

    assert!(matches!(
        engine.decide_and_assign(&test.id, &Identity::user("early")),
        Err(ExperimentError::TestNotActive { .. })
    ));

    engine.start_test(&test.id).unwrap();
    let first = engine
        .decide_and_assign(&test.id, &Identity::user("known"))
        .unwrap();
    assert!(first.included);

    engine.pause_test(&test.id).unwrap();

    // Known identities keep their assignment while paused; new ones are refused
    let again = engine
        .decide_and_assign(&test.id, &Identity::user("known"))
        .unwrap();
    assert_eq!(again.variant_id, first.variant_id);
    assert!(!again.newly_assigned);
    assert!(matches!(
        engine.decide_and_assign(&test.id, &Identity::user("late")),
        Err(ExperimentError::TestNotActive { .. })
    ));

    engine.complete_test(&test.id).unwrap();
    assert!(matches!(
        engine.decide_and_assign(&test.id, &Identity::user("known")),
        Err(ExperimentError::TestNotActive { .. })
    ));
}

#[test]
fn test_events_rejected_after_completion() {
    let engine = engine();
    let test = running_test(&engine, two_arm("closed"));
    let outcome = engine
        .decide_and_assign(&test.id, &Identity::user("buyer"))
        .unwrap();
    let participant_id = outcome.participant_id.unwrap();
    let variant_id = outcome.variant_id.unwrap();

    engine.complete_test(&test.id).unwrap();
    let err = engine
        .record_event(
            &participant_id,
            &variant_id,
            &test.id,
            EventType::Conversion,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ExperimentError::TestNotActive { .. }));
}

#[test]
fn test_events_while_paused_follow_config() {
    let strict = ExperimentEngine::in_memory(EngineConfig {
        record_events_while_paused: false,
        ..Default::default()
    });
    let test = running_test(&strict, two_arm("paused-events"));
    let outcome = strict
        .decide_and_assign(&test.id, &Identity::user("viewer"))
        .unwrap();
    strict.pause_test(&test.id).unwrap();

    let result = strict.record_event(
        &outcome.participant_id.unwrap(),
        &outcome.variant_id.unwrap(),
        &test.id,
        EventType::View,
        None,
    );
    assert!(matches!(result, Err(ExperimentError::TestNotActive { .. })));

    let lenient = engine();
    let test = running_test(&lenient, two_arm("paused-events"));
    let outcome = lenient
        .decide_and_assign(&test.id, &Identity::user("viewer"))
        .unwrap();
    lenient.pause_test(&test.id).unwrap();
    assert!(lenient
        .record_event(
            &outcome.participant_id.unwrap(),
            &outcome.variant_id.unwrap(),
            &test.id,
            EventType::View,
            None,
        )
        .is_ok());
}

// ============================================================================
// ASSIGNMENT
// ============================================================================

#[test]
fn test_assignment_is_deterministic_and_idempotent() {
    let engine = engine();
    let test = running_test(&engine, two_arm("sticky"));
    let identity = Identity::user("user-42");

    let first = engine.decide_and_assign(&test.id, &identity).unwrap();
    assert!(first.included);
    assert!(first.newly_assigned);

    for _ in 0..5 {
        let again = engine.decide_and_assign(&test.id, &identity).unwrap();
        assert_eq!(again.variant_id, first.variant_id);
        assert_eq!(again.participant_id, first.participant_id);
        assert!(!again.newly_assigned);
    }

    assert_eq!(engine.participants(&test.id).unwrap().len(), 1);
    let test = engine.get_test(&test.id).unwrap();
    assert_eq!(test.total_participants(), 1);
}

#[test]
fn test_traffic_allocation_half_included_reproducibly() {
    let engine = engine();
    let test = running_test(&engine, two_arm("half").with_traffic_allocation(50.0));

    let mut included = HashSet::new();
    for i in 0..4000 {
        let outcome = engine
            .decide_and_assign(&test.id, &Identity::user(format!("visitor-{i}")))
            .unwrap();
        if outcome.included {
            included.insert(i);
        } else {
            assert!(outcome.variant_id.is_none());
            assert!(outcome.participant_id.is_none());
        }
    }

    let share = included.len() as f64 / 4000.0;
    assert!(share > 0.45 && share < 0.55, "included share {share}");

    // Repeat calls reproduce both inclusion and exclusion
    for i in 0..4000 {
        let outcome = engine
            .decide_and_assign(&test.id, &Identity::user(format!("visitor-{i}")))
            .unwrap();
        assert_eq!(outcome.included, included.contains(&i));
    }
    assert_eq!(
        engine.participants(&test.id).unwrap().len(),
        included.len()
    );
}

#[test]
fn test_zero_traffic_variant_never_assigned() {
    let engine = engine();
    let spec = NewTest::new(
        "dark-launch",
        vec![
            VariantSpec::control("control", 100.0),
            VariantSpec::treatment("dark", 0.0),
        ],
    );
    let test = running_test(&engine, spec);
    let control_id = test.control().unwrap().id;

    for i in 0..500 {
        let outcome = engine
            .decide_and_assign(&test.id, &Identity::user(format!("u{i}")))
            .unwrap();
        assert_eq!(outcome.variant_id, Some(control_id));
    }
}

#[test]
fn test_anonymous_identities_share_a_bucket() {
    let engine = engine();
    let test = running_test(&engine, two_arm("anonymous"));

    let a = engine
        .decide_and_assign(&test.id, &Identity::Anonymous)
        .unwrap();
    let b = engine
        .decide_and_assign(&test.id, &Identity::from_parts(None, None))
        .unwrap();

    assert!(a.anonymous);
    assert_eq!(a.participant_id, b.participant_id);
    assert!(!b.newly_assigned);
}

#[test]
fn test_invalid_identity_rejected() {
    let engine = engine();
    let test = running_test(&engine, two_arm("identity"));
    let err = engine
        .decide_and_assign(&test.id, &Identity::user(""))
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

// ============================================================================
// EVENTS AND ROLLUPS
// ============================================================================

#[test]
fn test_conversion_counted_once_per_participant() {
    let engine = engine();
    let test = running_test(&engine, two_arm("once"));
    let outcome = engine
        .decide_and_assign(&test.id, &Identity::user("repeat-buyer"))
        .unwrap();
    let participant_id = outcome.participant_id.unwrap();
    let variant_id = outcome.variant_id.unwrap();

    for value in [20.0, 35.0, 50.0] {
        engine
            .record_event(
                &participant_id,
                &variant_id,
                &test.id,
                EventType::Conversion,
                Some(value),
            )
            .unwrap();
    }

    let test = engine.get_test(&test.id).unwrap();
    let rollup = &test.variant(&variant_id).unwrap().rollup;
    assert_eq!(rollup.participants_count, 1);
    assert_eq!(rollup.conversions_count, 1);
    assert_eq!(rollup.total_value, 20.0);

    let participant = engine.participant(&participant_id).unwrap();
    assert!(participant.converted);
    assert_eq!(participant.conversion_value, Some(20.0));

    // All three events remain in the log
    assert_eq!(engine.events(&test.id).unwrap().len(), 3);
}

#[test]
fn test_views_and_custom_events_leave_conversions_alone() {
    let engine = engine();
    let test = running_test(&engine, two_arm("browsing"));
    let outcome = engine
        .decide_and_assign(&test.id, &Identity::session("sess-1"))
        .unwrap();
    let participant_id = outcome.participant_id.unwrap();
    let variant_id = outcome.variant_id.unwrap();

    for event_type in [
        EventType::View,
        EventType::View,
        EventType::Click,
        EventType::Custom("scroll_depth".to_string()),
    ] {
        engine
            .record_event(&participant_id, &variant_id, &test.id, event_type, None)
            .unwrap();
    }

    let participant = engine.participant(&participant_id).unwrap();
    assert_eq!(participant.page_views, 2);
    assert!(!participant.converted);
    assert_eq!(engine.get_test(&test.id).unwrap().total_conversions(), 0);
}

#[test]
fn test_event_for_wrong_variant_rejected() {
    let engine = engine();
    let test = running_test(&engine, two_arm("mismatch"));
    let outcome = engine
        .decide_and_assign(&test.id, &Identity::user("u1"))
        .unwrap();
    let other = test
        .variants
        .iter()
        .find(|v| Some(v.id) != outcome.variant_id)
        .unwrap()
        .id;

    let err = engine
        .record_event(
            &outcome.participant_id.unwrap(),
            &other,
            &test.id,
            EventType::Conversion,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ExperimentError::InvalidInput { .. }));
    assert_eq!(engine.get_test(&test.id).unwrap().total_conversions(), 0);
}

#[test]
fn test_event_for_unknown_participant_rejected() {
    let engine = engine();
    let test = running_test(&engine, two_arm("ghost"));
    let err = engine
        .record_event(
            &shodh_experiments::experiment::ParticipantId::new(),
            &test.variants[0].id,
            &test.id,
            EventType::View,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ExperimentError::ParticipantNotFound(_)));
}

// ============================================================================
// ANALYSIS
// ============================================================================

#[test]
fn test_significant_lift_declares_variant_winner() {
    let engine = engine();
    let test = running_test(&engine, two_arm("lift"));
    let control = test.control().unwrap().id;
    let treatment = test.treatments().next().unwrap().id;

    seed_variant(&engine, &test, control, "c", 1000, 100);
    seed_variant(&engine, &test, treatment, "t", 1000, 130);

    let result = engine.analyze(&test.id, false).unwrap();
    assert!(result.analysis_completed);
    assert_eq!(result.status, AnalysisStatus::Completed);
    assert_eq!(result.sample_size, 2000);

    let p = result.p_value.unwrap();
    assert!(p > 0.025 && p < 0.04, "p-value {p}");
    assert!(result.is_significant);
    assert_eq!(result.winner_variant_id, Some(treatment));
    assert!((result.uplift_percentage - 30.0).abs() < 1e-6);
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("treatment") && r.contains("wins")));

    let latest = engine.latest_analysis(&test.id).unwrap().unwrap();
    assert_eq!(latest.id, result.id);
}

#[test]
fn test_small_sample_reports_insufficient_data() {
    let engine = engine();
    let test = running_test(&engine, two_arm("tiny"));
    let control = test.control().unwrap().id;
    let treatment = test.treatments().next().unwrap().id;

    seed_variant(&engine, &test, control, "c", 20, 2);
    seed_variant(&engine, &test, treatment, "t", 20, 5);

    let result = engine.analyze(&test.id, false).unwrap();
    assert!(!result.analysis_completed);
    assert_eq!(result.status, AnalysisStatus::InsufficientSample);
    assert!(result.p_value.is_none());
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("Insufficient data")));

    let forced = engine.analyze(&test.id, true).unwrap();
    assert!(forced.analysis_completed);
    assert!(forced.forced);
    assert!(forced.p_value.is_some());
}

#[test]
fn test_analysis_snapshots_are_kept_in_order() {
    let engine = engine();
    let test = running_test(&engine, two_arm("history"));
    let control = test.control().unwrap().id;
    let treatment = test.treatments().next().unwrap().id;
    seed_variant(&engine, &test, control, "c", 40, 4);
    seed_variant(&engine, &test, treatment, "t", 40, 6);

    let first = engine.analyze(&test.id, false).unwrap();
    seed_variant(&engine, &test, treatment, "t2", 10, 3);
    let second = engine.analyze(&test.id, false).unwrap();

    let history = engine.analysis_history(&test.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[1].id, second.id);
    assert_eq!(history[0].sample_size, 80);
    assert_eq!(history[1].sample_size, 90);
}

#[test]
fn test_summary_counts_across_tests() {
    let engine = engine();
    let running = running_test(&engine, two_arm("live"));
    engine.create_test(two_arm("queued")).unwrap();

    let control = running.control().unwrap().id;
    seed_variant(&engine, &running, control, "c", 10, 5);

    let summary = engine.summary().unwrap();
    assert_eq!(summary.total_tests, 2);
    assert_eq!(summary.tests_by_status["running"], 1);
    assert_eq!(summary.tests_by_status["draft"], 1);
    assert_eq!(summary.total_participants, 10);
    assert_eq!(summary.total_conversions, 5);
    assert!((summary.overall_conversion_rate - 0.5).abs() < 1e-12);
}
