use std::sync::Arc;

use cadence_core::config::SchedulerConfig;
use cadence_core::event::EventBus;
use cadence_core::types::{EnrollmentStatus, Scenario, ScenarioId, SubjectId};
use cadence_engine::{ActionDispatcher, EnrollOutcome, Engine};
use cadence_graph::{decode, encode, NodeGraph};
use cadence_store::SqliteStore;
use cadence_test_utils::fixtures::at;
use cadence_test_utils::RecordingSender;

const SCENARIO_JSON: &str = r#"{
    "id": "checkup",
    "name": "Checkup reminder",
    "trigger": {"kind": "keyword", "pattern": "checkup", "mode": "contains"},
    "steps": [
        {"sortOrder": 0, "stepType": "send_text", "content": "Thanks for reaching out"},
        {"sortOrder": 1, "stepType": "condition",
         "conditionRules": [{"type": "tag", "tagIds": ["booked"], "match": "any_include"}],
         "branchTrueStep": 3, "branchFalseStep": 2},
        {"sortOrder": 2, "stepType": "send_text", "content": "Book your checkup today",
         "delayType": "days", "delayValue": 2, "sendTime": "09:00"},
        {"sortOrder": 3, "stepType": "tag_add", "tagId": "reminded"}
    ]
}"#;

#[tokio::test]
async fn edited_graph_drives_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("cadence.db")).unwrap());
    let sender = Arc::new(RecordingSender::new());
    let engine = Engine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ActionDispatcher::new(sender.clone(), store.clone()),
        &SchedulerConfig::default(),
        Arc::new(EventBus::default()),
    )
    .unwrap();

    let mut scenario: Scenario = serde_json::from_str(SCENARIO_JSON).unwrap();
    engine.save_scenario(&scenario).await.unwrap();

    // Export, ship over the wire, edit the reminder text and import back
    let wire = serde_json::to_string(&encode(&scenario.steps)).unwrap();
    let mut graph: NodeGraph = serde_json::from_str(&wire).unwrap();
    assert!(graph.node("wait-2").is_some());
    let reminder = graph
        .nodes
        .iter_mut()
        .find(|n| n.id == "step-2")
        .unwrap();
    reminder.data["content"] = serde_json::json!("Your checkup is waiting");
    scenario.steps = decode(&graph).unwrap();
    engine.save_scenario(&scenario).await.unwrap();

    let t0 = at(2025, 5, 5, 14, 0);
    let subject = SubjectId::from("p1");
    let outcomes = engine
        .on_keyword_at(&subject, "When is my Checkup?", t0)
        .await
        .unwrap();
    assert!(matches!(outcomes[0].1, EnrollOutcome::Enrolled(_)));

    engine.tick_at(t0).await.unwrap();
    engine.tick_at(t0).await.unwrap();

    // Not booked: the reminder waits two days and fires at 09:00
    let due = at(2025, 5, 7, 9, 0);
    let enrollments = engine.subject_enrollments(&subject).await.unwrap();
    assert_eq!(enrollments[0].current_step, 2);
    assert_eq!(enrollments[0].next_fire_at, Some(due));

    engine.tick_at(due).await.unwrap();
    engine.tick_at(due).await.unwrap();
    assert_eq!(
        sender.texts_for("p1"),
        vec![
            "Thanks for reaching out".to_string(),
            "Your checkup is waiting".to_string()
        ]
    );
    assert!(store.subject_profile(&subject).unwrap().tags.contains("reminded"));

    let stored = engine.load_scenario(&ScenarioId::from("checkup")).await.unwrap();
    assert_eq!(stored.steps, scenario.steps);
    let enrollments = engine.subject_enrollments(&subject).await.unwrap();
    assert_eq!(enrollments[0].status, EnrollmentStatus::Completed);
}
