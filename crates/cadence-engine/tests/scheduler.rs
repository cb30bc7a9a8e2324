use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use cadence_core::event::{EngineEvent, EventBus};
use cadence_core::facts::{BehaviorFacts, SubjectProfile};
use cadence_core::rules::{BehaviorMetric, CompareOp, ConditionRule, RuleSet, TagMatch};
use cadence_core::step::{DelaySpec, ExitAction, Step, StepProgram};
use cadence_core::traits::{EnrollmentStore, FactsProvider, SubjectMutator};
use cadence_core::types::{
    Enrollment, EnrollmentId, EnrollmentStatus, Scenario, ScenarioId, SubjectId, Trigger,
};
use cadence_core::CadenceError;
use cadence_engine::{ActionDispatcher, EnrollOutcome, Engine};
use cadence_store::SqliteStore;
use cadence_test_utils::fixtures::{at, vip_scenario};
use cadence_test_utils::{init_tracing, RecordingSender, StaticFacts};
use serde_json::json;

fn build(
    store: &Arc<SqliteStore>,
    sender: Arc<RecordingSender>,
    facts: Arc<dyn FactsProvider>,
    config: &SchedulerConfig,
) -> Engine {
    init_tracing();
    Engine::new(
        store.clone(),
        store.clone(),
        facts,
        ActionDispatcher::new(sender, store.clone()),
        config,
        Arc::new(EventBus::default()),
    )
    .unwrap()
}

fn setup() -> (Engine, Arc<SqliteStore>, Arc<RecordingSender>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::new());
    let engine = build(&store, sender.clone(), store.clone(), &SchedulerConfig::default());
    (engine, store, sender)
}

async fn enroll(engine: &Engine, scenario: &str, subject: &str, now: chrono::DateTime<chrono::Utc>) -> Enrollment {
    match engine
        .enroll_at(&ScenarioId::from(scenario), &SubjectId::from(subject), now)
        .await
        .unwrap()
    {
        EnrollOutcome::Enrolled(e) => e,
        other => panic!("expected enrollment, got {:?}", other),
    }
}

async fn reload(store: &SqliteStore, id: EnrollmentId) -> Enrollment {
    store.load_enrollment(id).await.unwrap().unwrap()
}

fn scenario(id: &str, steps: Vec<Step>) -> Scenario {
    Scenario::new(id, id, Trigger::Manual, StepProgram::new(steps).unwrap())
}

#[tokio::test]
async fn regular_subject_walks_false_branch() {
    let (engine, store, sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    let e = enroll(&engine, "vip", "p1", t0).await;
    assert_eq!(e.current_step, 0);
    assert_eq!(e.next_fire_at, Some(t0));

    // Welcome message, then the condition is due right away
    let report = engine.tick_at(t0).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.advanced, 1);
    assert_eq!(sender.texts_for("p1"), vec!["Welcome to the clinic".to_string()]);
    let e = reload(&store, e.id).await;
    assert_eq!((e.current_step, e.next_fire_at), (1, Some(t0)));

    // Not a VIP: false branch to the delayed tag step
    engine.tick_at(t0).await.unwrap();
    let e = reload(&store, e.id).await;
    assert_eq!(e.current_step, 2);
    assert_eq!(e.next_fire_at, Some(t0 + chrono::Duration::hours(1)));

    assert_eq!(engine.tick_at(t0).await.unwrap().due, 0);

    let t1 = t0 + chrono::Duration::hours(1);
    engine.tick_at(t1).await.unwrap();
    assert!(store.subject_profile(&SubjectId::from("p1")).unwrap().tags.contains("followup"));

    engine.tick_at(t1).await.unwrap();
    assert_eq!(store.subject_menu(&SubjectId::from("p1")).unwrap().as_deref(), Some("menu-b"));
    let e = reload(&store, e.id).await;
    assert_eq!(e.status, EnrollmentStatus::Completed);
    assert_eq!(e.next_fire_at, None);
    assert_eq!(sender.sent().len(), 1);
}

#[tokio::test]
async fn vip_subject_skips_to_menu_change() {
    let (engine, store, _sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    store.add_tag(&SubjectId::from("p1"), "vip").await.unwrap();
    let e = enroll(&engine, "vip", "p1", t0).await;

    for _ in 0..3 {
        engine.tick_at(t0).await.unwrap();
    }

    let e = reload(&store, e.id).await;
    assert_eq!(e.status, EnrollmentStatus::Completed);
    let profile = store.subject_profile(&SubjectId::from("p1")).unwrap();
    assert!(!profile.tags.contains("followup"));
    assert_eq!(store.subject_menu(&SubjectId::from("p1")).unwrap().as_deref(), Some("menu-b"));
}

#[tokio::test]
async fn day_delay_fires_at_anchor_in_local_time() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::new());
    let config = SchedulerConfig {
        utc_offset_hours: 9,
        default_send_time: "10:00".into(),
        ..Default::default()
    };
    let engine = build(&store, sender.clone(), store.clone(), &config);
    engine
        .save_scenario(&scenario(
            "reminder",
            vec![
                Step::send_text("first"),
                Step::send_text("second").with_delay(DelaySpec::days(1)),
            ],
        ))
        .await
        .unwrap();

    // 18:00 local on Jan 1
    let t0 = at(2025, 1, 1, 9, 0);
    let e = enroll(&engine, "reminder", "p1", t0).await;
    engine.tick_at(t0).await.unwrap();

    // 10:00 local on Jan 2
    let due = at(2025, 1, 2, 1, 0);
    assert_eq!(reload(&store, e.id).await.next_fire_at, Some(due));

    engine.tick_at(due - chrono::Duration::minutes(1)).await.unwrap();
    assert_eq!(sender.texts_for("p1").len(), 1);
    engine.tick_at(due).await.unwrap();
    assert_eq!(sender.texts_for("p1"), vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_never_send_twice() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::slow(Duration::from_millis(20)));
    let config = SchedulerConfig {
        page_size: 7,
        ..Default::default()
    };
    let a = Arc::new(build(&store, sender.clone(), store.clone(), &config));
    let b = Arc::new(build(&store, sender.clone(), store.clone(), &config));

    let t0 = at(2025, 3, 1, 9, 0);
    a.save_scenario(&vip_scenario("vip")).await.unwrap();
    for i in 0..20 {
        enroll(&a, "vip", &format!("p{i}"), t0).await;
    }

    let ha = tokio::spawn({
        let a = a.clone();
        async move { a.tick_at(t0).await }
    });
    let hb = tokio::spawn({
        let b = b.clone();
        async move { b.tick_at(t0).await }
    });
    let ra = ha.await.unwrap().unwrap();
    let rb = hb.await.unwrap().unwrap();

    assert_eq!(ra.errors + rb.errors, 0);
    assert!(ra.advanced + rb.advanced >= 20);
    for i in 0..20 {
        assert_eq!(
            sender.texts_for(&format!("p{i}")),
            vec!["Welcome to the clinic".to_string()],
            "subject p{i}"
        );
    }
}

#[tokio::test]
async fn exit_guard_wins_over_action() {
    let (engine, store, sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    let stop = RuleSet::all(vec![ConditionRule::tags(TagMatch::AnyInclude, ["stop"])]);
    engine
        .save_scenario(&scenario(
            "guarded",
            vec![
                Step::send_text("a").with_exit(stop, ExitAction::Terminate),
                Step::send_text("b"),
            ],
        ))
        .await
        .unwrap();
    let e = enroll(&engine, "guarded", "p1", t0).await;
    store.add_tag(&SubjectId::from("p1"), "stop").await.unwrap();

    let report = engine.tick_at(t0).await.unwrap();
    assert_eq!(report.advanced, 1);
    assert!(sender.sent().is_empty());
    let e = reload(&store, e.id).await;
    assert_eq!(e.status, EnrollmentStatus::Exited);
    assert!(e.exit_reason.unwrap().contains("exit rule"));
}

#[tokio::test]
async fn failed_action_still_advances() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::failing());
    let engine = build(&store, sender, store.clone(), &SchedulerConfig::default());
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    let e = enroll(&engine, "vip", "p1", t0).await;

    let mut events = engine.event_bus().subscribe();
    let report = engine.tick_at(t0).await.unwrap();
    assert_eq!(report.advanced, 1);
    assert_eq!(report.action_failures, 1);
    assert_eq!(reload(&store, e.id).await.current_step, 1);
    assert!(matches!(
        events.try_recv().unwrap(),
        EngineEvent::ActionFailed { step: 0, .. }
    ));
}

#[tokio::test]
async fn exit_all_stops_every_scenario() {
    let (engine, store, sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("one")).await.unwrap();
    engine.save_scenario(&vip_scenario("two")).await.unwrap();
    let one = enroll(&engine, "one", "p1", t0).await;
    enroll(&engine, "two", "p1", t0).await;
    enroll(&engine, "one", "p2", t0).await;

    let changed = engine
        .exit_all_at(&SubjectId::from("p1"), "unsubscribed", t0)
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert_eq!(
        engine.exit_all_at(&SubjectId::from("p1"), "again", t0).await.unwrap(),
        0
    );

    engine.tick_at(t0).await.unwrap();
    assert!(sender.texts_for("p1").is_empty());
    assert_eq!(sender.texts_for("p2").len(), 1);

    let one = reload(&store, one.id).await;
    assert_eq!(one.status, EnrollmentStatus::Exited);
    assert_eq!(one.exit_reason.as_deref(), Some("unsubscribed"));
}

#[tokio::test]
async fn jump_moves_active_enrollment() {
    let (engine, store, sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    let e = enroll(&engine, "vip", "p1", t0).await;

    assert!(engine.jump_to_at(e.id, 3, t0).await.unwrap());
    engine.tick_at(t0).await.unwrap();
    assert!(sender.sent().is_empty());
    assert_eq!(store.subject_menu(&SubjectId::from("p1")).unwrap().as_deref(), Some("menu-b"));
    assert_eq!(reload(&store, e.id).await.status, EnrollmentStatus::Completed);

    assert!(!engine.jump_to_at(e.id, 0, t0).await.unwrap());
    assert!(matches!(
        engine.jump_to_at(EnrollmentId(999), 0, t0).await.unwrap_err(),
        CadenceError::EnrollmentNotFound(999)
    ));
}

#[tokio::test]
async fn jump_past_end_completes() {
    let (engine, store, _sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    let e = enroll(&engine, "vip", "p1", t0).await;

    assert!(engine.jump_to_at(e.id, 10, t0).await.unwrap());
    assert_eq!(reload(&store, e.id).await.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn enrollment_rules() {
    let (engine, _store, sender) = setup();
    let t0 = at(2025, 3, 1, 9, 0);
    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    enroll(&engine, "vip", "p1", t0).await;

    assert_eq!(
        engine
            .enroll_at(&ScenarioId::from("vip"), &SubjectId::from("p1"), t0)
            .await
            .unwrap(),
        EnrollOutcome::AlreadyEnrolled
    );
    assert!(matches!(
        engine
            .enroll_at(&ScenarioId::from("missing"), &SubjectId::from("p1"), t0)
            .await
            .unwrap_err(),
        CadenceError::ScenarioNotFound(_)
    ));

    // Disabling blocks new enrollments only
    let mut disabled = vip_scenario("vip");
    disabled.enabled = false;
    engine.save_scenario(&disabled).await.unwrap();
    assert!(matches!(
        engine
            .enroll_at(&ScenarioId::from("vip"), &SubjectId::from("p2"), t0)
            .await
            .unwrap(),
        EnrollOutcome::Skipped(_)
    ));
    engine.tick_at(t0).await.unwrap();
    assert_eq!(sender.texts_for("p1").len(), 1);
}

#[tokio::test]
async fn facts_failure_fails_closed() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::new());
    let facts = Arc::new(StaticFacts::new());
    facts.set_profile("p1", SubjectProfile::with_tags(["vip"]));
    facts.fail_profiles(true);
    let engine = build(&store, sender.clone(), facts.clone(), &SchedulerConfig::default());
    let t0 = at(2025, 3, 1, 9, 0);

    engine.save_scenario(&vip_scenario("vip")).await.unwrap();
    engine
        .save_scenario(&scenario(
            "not-blocked",
            vec![
                Step::condition(
                    RuleSet::all(vec![ConditionRule::tags(TagMatch::AnyExclude, ["blocked"])]),
                    None,
                    None,
                ),
                Step::send_text("ok"),
            ],
        ))
        .await
        .unwrap();
    let vip = enroll(&engine, "vip", "p1", t0).await;
    let excl = enroll(&engine, "not-blocked", "p1", t0).await;

    engine.tick_at(t0).await.unwrap();
    engine.tick_at(t0).await.unwrap();

    // The VIP tag is unknown, so the false branch is taken
    assert_eq!(reload(&store, vip.id).await.current_step, 2);
    // Even an exclusion rule does not match without facts
    assert_eq!(reload(&store, excl.id).await.status, EnrollmentStatus::Completed);
    assert_eq!(sender.texts_for("p1"), vec!["Welcome to the clinic".to_string()]);
}

#[tokio::test]
async fn facts_are_fetched_once_per_tick() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let sender = Arc::new(RecordingSender::new());
    let facts = Arc::new(StaticFacts::new());
    let config = SchedulerConfig {
        page_size: 2,
        ..Default::default()
    };
    let engine = build(&store, sender.clone(), facts.clone(), &config);
    let t0 = at(2025, 3, 1, 9, 0);

    let rules = RuleSet::all(vec![
        ConditionRule::tags(TagMatch::AnyInclude, ["vip"]),
        ConditionRule::Behavior {
            metric: BehaviorMetric::VisitCount,
            operator: CompareOp::Ge,
            value: json!(2),
            value2: None,
            window_days: Some(30),
        },
        ConditionRule::behavior(BehaviorMetric::PurchaseAmount, CompareOp::Gt, json!("100")),
    ]);
    engine
        .save_scenario(&scenario(
            "loyal",
            vec![Step::condition(rules, None, None), Step::send_text("thanks")],
        ))
        .await
        .unwrap();
    for i in 0..5 {
        enroll(&engine, "loyal", &format!("p{i}"), t0).await;
    }

    facts.set_profile("p0", SubjectProfile::with_tags(["vip"]));
    facts.set_behavior(
        "p0",
        Some(30),
        BehaviorFacts {
            visit_count: 2,
            ..Default::default()
        },
    );
    facts.set_behavior(
        "p0",
        None,
        BehaviorFacts {
            visit_count: 9,
            purchase_total: 150.0,
            ..Default::default()
        },
    );

    let report = engine.tick_at(t0).await.unwrap();
    assert_eq!(report.advanced, 5);
    // Read in pages of 2, 2 and 1, but facts come in one batch per kind
    assert_eq!(report.due, 5);
    assert_eq!(facts.profile_calls(), 1);
    assert_eq!(facts.behavior_calls(), 2);

    let enrollments = engine.subject_enrollments(&SubjectId::from("p0")).await.unwrap();
    assert_eq!(enrollments[0].current_step, 1);
    let enrollments = engine.subject_enrollments(&SubjectId::from("p1")).await.unwrap();
    assert_eq!(enrollments[0].status, EnrollmentStatus::Completed);

    // The send step has no rules: no further lookups
    engine.tick_at(t0).await.unwrap();
    assert_eq!(facts.profile_calls(), 1);
    assert_eq!(facts.behavior_calls(), 2);
    assert_eq!(sender.texts_for("p0"), vec!["thanks".to_string()]);
}

#[tokio::test]
async fn far_future_delay_stays_schedulable() {
    let (engine, store, sender) = setup();
    let unbounded = StepProgram::new(vec![
        Step::send_text("first"),
        Step::send_text("never").with_delay(DelaySpec::days(3_000_000)),
    ]);
    assert!(matches!(unbounded, Err(CadenceError::InvalidStep { index: 1, .. })));

    engine
        .save_scenario(&scenario(
            "decade",
            vec![
                Step::send_text("first"),
                Step::send_text("second").with_delay(DelaySpec::days(3650)),
            ],
        ))
        .await
        .unwrap();
    let t0 = at(9995, 1, 1, 9, 0);
    let late = enroll(&engine, "decade", "p1", t0).await;
    engine.tick_at(t0).await.unwrap();

    let latest = cadence_engine::schedule::latest_fire();
    assert_eq!(reload(&store, late.id).await.next_fire_at, Some(latest));

    // Rows written after the capped one are still read back
    enroll(&engine, "decade", "p2", t0).await;
    let report = engine.tick_at(t0).await.unwrap();
    assert_eq!((report.due, report.errors), (1, 0));
    assert_eq!(sender.texts_for("p2"), vec!["first".to_string()]);

    engine.tick_at(latest).await.unwrap();
    assert_eq!(sender.texts_for("p1"), vec!["first".to_string(), "second".to_string()]);
}
