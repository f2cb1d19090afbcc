//! Roundtrip serialisation tests for `apqp-core` types that cross the daemon
//! socket or land in JSON columns.

use std::collections::BTreeSet;

use apqp_core::types::{
    ConflictId, ConflictKind, ConflictSummary, ConflictValue, Direction, DocumentKind,
    HierarchyNode, NodeId, NodeKind, ProjectKey, SyncConflict, SyncLogEntry, SyncOutcome,
    SyncWatermark,
};
use apqp_core::{Config, LogOperation, ReadinessState, SyncPolicy};
use chrono::Utc;
use rstest::rstest;

fn node() -> HierarchyNode {
    HierarchyNode {
        id: NodeId::from("PRJ-D-P001-002"),
        kind: NodeKind::Detector,
        parent: Some(NodeId::from("PRJ-P-001")),
        ordinal: 2,
        fields: Default::default(),
        last_modified: Utc::now(),
        origin: DocumentKind::Pfmea,
    }
    .with_field("name", "Torque station")
    .with_field("equipment", "Ключ-🔧")
}

fn conflict(source_value: ConflictValue, target_value: ConflictValue) -> SyncConflict {
    SyncConflict {
        id: ConflictId::from("cf-0123456789abcdef"),
        direction: Direction::PfmeaToControlPlan,
        node_id: NodeId::from("PRJ-D-P001-002"),
        kind: ConflictKind::FieldValueDivergence,
        field: Some("equipment".to_string()),
        source_value,
        target_value,
        detected_at: Utc::now(),
    }
}

#[rstest]
#[case::absent(ConflictValue::Absent, ConflictValue::field(Some("gauge")))]
#[case::position(
    ConflictValue::Position { parent: Some(NodeId::from("PRJ-P-001")), ordinal: 3 },
    ConflictValue::Position { parent: None, ordinal: 1 }
)]
#[case::whole_node(ConflictValue::Node { node: Box::new(node()) }, ConflictValue::Absent)]
fn conflict_json_roundtrip(#[case] source: ConflictValue, #[case] target: ConflictValue) {
    let original = conflict(source, target);
    let json = serde_json::to_string(&original).expect("serialize");
    let back: SyncConflict = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, original);
}

#[test]
fn node_kind_serializes_as_type_code() {
    let json = serde_json::to_value(node()).expect("serialize");
    assert_eq!(json["kind"], "D");
    assert_eq!(json["origin"], "pfmea");
}

#[test]
fn watermark_without_held_field_deserializes() {
    let json = r#"{"direction":"control_plan_to_pfmea","synced_at":"2026-01-02T03:04:05Z","version":4}"#;
    let watermark: SyncWatermark = serde_json::from_str(json).expect("deserialize");
    assert_eq!(watermark.version, 4);
    assert_eq!(watermark.held, BTreeSet::new());
}

#[test]
fn log_entry_roundtrip() {
    let now = Utc::now();
    let entry = SyncLogEntry {
        seq: 7,
        project: ProjectKey::from("brake"),
        direction: Direction::ControlPlanToPfmea,
        operation: LogOperation::Sync,
        requested_at: now,
        completed_at: now,
        outcome: SyncOutcome::PartialSuccess,
        added: 1,
        updated: 2,
        removed: 0,
        orphans: 1,
        conflicts: vec![ConflictSummary::new(
            &conflict(ConflictValue::field(Some("a")), ConflictValue::field(Some("b"))),
            None,
        )],
        error_detail: None,
    };
    let json = serde_json::to_string(&entry).expect("serialize");
    let back: SyncLogEntry = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, entry);
    assert!(back.conflicts[0].is_pending());
}

#[rstest]
#[case(ReadinessState::Ready)]
#[case(ReadinessState::Failed("disk full".to_string()))]
fn readiness_roundtrip(#[case] state: ReadinessState) {
    let json = serde_json::to_string(&state).expect("serialize");
    let back: ReadinessState = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, state);
}

#[test]
fn config_yaml_roundtrip() {
    let config = Config {
        default_policy: SyncPolicy::TargetWins,
        allow_deletions: true,
        ..Config::default()
    };
    let yaml = serde_yaml::to_string(&config).expect("serialize");
    let back: Config = serde_yaml::from_str(&yaml).expect("deserialize");
    assert_eq!(back, config);
}
