mod common;

use apqp_core::types::{
    ConflictKind, DocumentKind, NodeId, ResolutionOutcome, SyncOutcome, SyncPolicy,
};
use apqp_sync::mapper::map_to_target;
use apqp_sync::store::NamespaceStore;
use rstest::rstest;
use tempfile::TempDir;

use common::*;

const DETECTOR: &str = "PRJ-D-P001-001";
const WORK_ELEMENT: &str = "PRJ-WE-P001-001";

async fn synced_once(home: &TempDir) -> apqp_sync::SyncOrchestrator<apqp_sync::SqliteStore> {
    let orch = sqlite_orchestrator(home).await;
    orch.store()
        .replace_document(&key(), DocumentKind::Pfmea, weld_pfmea())
        .expect("seed");
    let first = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("first sync");
    assert_eq!(first.outcome, SyncOutcome::Success);
    orch
}

#[tokio::test]
async fn first_sync_adds_every_mapped_node() {
    let home = TempDir::new().expect("home");
    let orch = sqlite_orchestrator(&home).await;
    orch.store()
        .replace_document(&key(), DocumentKind::Pfmea, weld_pfmea())
        .expect("seed");

    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");

    assert_eq!(response.outcome, SyncOutcome::Success);
    // Process, detector and control item; the failure mode has no counterpart.
    assert_eq!((response.added, response.updated, response.removed), (3, 0, 0));
    assert!(response
        .conflicts
        .iter()
        .all(|c| c.kind == ConflictKind::StructuralAdd
            && c.resolution == Some(ResolutionOutcome::KeepSource)));

    let cp = load(orch.store(), DocumentKind::ControlPlan);
    assert_eq!(cp.tree.len(), 3);
    let detector = cp.tree.get(&NodeId::from(DETECTOR)).expect("detector");
    assert_eq!(detector.field("detection_method"), Some("visual"));
    assert_eq!(detector.origin, DocumentKind::Pfmea);
    assert!(cp.tree.contains(&NodeId::from("PRJ-CI-P001-D001-001")));
}

#[tokio::test]
async fn repeated_sync_changes_nothing() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;

    let again = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("second sync");
    assert_eq!(again.outcome, SyncOutcome::Success);
    assert_eq!((again.added, again.updated, again.removed), (0, 0, 0));
    assert!(again.conflicts.is_empty());
    assert!(again.new_conflict_ids.is_empty());
}

#[tokio::test]
async fn repeated_sync_raises_no_new_conflicts() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("visual (updated)"))
        .expect("edit");

    let first = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(first.new_conflict_ids.len(), 1);

    let second = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!((second.added, second.updated, second.removed), (0, 0, 0));
    assert_eq!(second.pending_conflict_ids, first.pending_conflict_ids);
    assert!(second.new_conflict_ids.is_empty());
}

#[tokio::test]
async fn concurrently_edited_field_is_held_for_review() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("visual (updated)"))
        .expect("edit");

    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");

    assert_eq!(response.outcome, SyncOutcome::PartialSuccess);
    assert_eq!((response.added, response.updated, response.removed), (0, 0, 0));
    assert_eq!(response.conflicts.len(), 1);
    let conflict = &response.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::FieldValueDivergence);
    assert_eq!(conflict.field.as_deref(), Some("detection_method"));
    assert!(conflict.is_pending());
    assert_eq!(response.pending_conflict_ids, vec![conflict.id.clone()]);

    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual (updated)")
    );
    let pending = orch.pending_conflicts(&key(), None).await.expect("pending");
    assert_eq!(pending.len(), 1);
}

#[rstest]
#[case(SyncPolicy::SourceWins)]
#[case(SyncPolicy::TargetWins)]
#[case(SyncPolicy::ManualOnly)]
#[tokio::test]
async fn new_source_node_is_added_under_every_policy(#[case] policy: SyncPolicy) {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    orch.store()
        .upsert_node(
            &key(),
            DocumentKind::Pfmea,
            &node("PRJ-WE-P001-002", DocumentKind::Pfmea, &[("name", "Station 2")]),
        )
        .expect("add work element");

    let response = orch.sync(&request(FORWARD, policy)).await.expect("sync");

    assert_eq!(response.outcome, SyncOutcome::Success);
    assert_eq!(response.added, 1);
    assert_eq!(response.conflicts.len(), 1);
    assert_eq!(response.conflicts[0].kind, ConflictKind::StructuralAdd);
    assert_eq!(response.conflicts[0].node_id.as_str(), "PRJ-D-P001-002");
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, "PRJ-D-P001-002", "name").as_deref(),
        Some("Station 2")
    );
}

#[rstest]
#[case(SyncPolicy::ManualOnly, Some("visual (updated)"), SyncOutcome::PartialSuccess, None)]
#[case(SyncPolicy::TargetWins, Some("visual (updated)"), SyncOutcome::Success, Some(ResolutionOutcome::KeepTarget))]
#[case(SyncPolicy::SourceWins, Some("borescope"), SyncOutcome::Success, Some(ResolutionOutcome::KeepSource))]
#[tokio::test]
async fn edited_target_field_is_never_silently_overwritten(
    #[case] policy: SyncPolicy,
    #[case] expected_value: Option<&str>,
    #[case] expected_outcome: SyncOutcome,
    #[case] expected_resolution: Option<ResolutionOutcome>,
) {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    let store = orch.store();
    store
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("visual (updated)"))
        .expect("target edit");
    store
        .set_field(&key(), DocumentKind::Pfmea, &NodeId::from(WORK_ELEMENT), "detection_method", Some("borescope"))
        .expect("source edit");

    let response = orch.sync(&request(FORWARD, policy)).await.expect("sync");

    assert_eq!(response.outcome, expected_outcome);
    assert_eq!(response.conflicts.len(), 1);
    assert_eq!(response.conflicts[0].kind, ConflictKind::FieldValueDivergence);
    assert_eq!(response.conflicts[0].resolution, expected_resolution);
    assert_eq!(
        field(store, DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        expected_value
    );
}

#[tokio::test]
async fn unedited_target_field_follows_source() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    orch.store()
        .set_field(&key(), DocumentKind::Pfmea, &NodeId::from(WORK_ELEMENT), "detection_method", Some("borescope"))
        .expect("source edit");

    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");

    assert_eq!(response.outcome, SyncOutcome::Success);
    assert_eq!(response.updated, 1);
    assert!(response.conflicts.is_empty());
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("borescope")
    );
}

#[tokio::test]
async fn kept_target_value_stays_protected_on_later_syncs() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("visual (updated)"))
        .expect("edit");
    orch.sync(&request(FORWARD, SyncPolicy::TargetWins))
        .await
        .expect("target wins");

    // The watermark moved past the edit, but the node stays held.
    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(response.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(response.conflicts[0].kind, ConflictKind::FieldValueDivergence);
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual (updated)")
    );
}

#[tokio::test]
async fn unedited_removal_propagates() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    orch.store()
        .remove_subtree(&key(), DocumentKind::Pfmea, &NodeId::from(WORK_ELEMENT))
        .expect("remove");

    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");

    assert_eq!(response.outcome, SyncOutcome::Success);
    assert_eq!(response.removed, 2);
    assert!(response.conflicts.is_empty());
    let cp = load(orch.store(), DocumentKind::ControlPlan);
    assert_eq!(cp.tree.len(), 1);
}

#[tokio::test]
async fn edited_removal_needs_allow_deletions() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "frequency", Some("1/shift"))
        .expect("target-only edit");
    orch.store()
        .remove_subtree(&key(), DocumentKind::Pfmea, &NodeId::from(WORK_ELEMENT))
        .expect("remove");

    let guarded = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("sync");
    assert_eq!(guarded.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(guarded.removed, 0);
    assert_eq!(guarded.conflicts.len(), 1);
    assert_eq!(guarded.conflicts[0].kind, ConflictKind::StructuralRemove);
    assert_eq!(guarded.conflicts[0].node_id.as_str(), DETECTOR);
    assert_eq!(load(orch.store(), DocumentKind::ControlPlan).tree.len(), 3);

    let allowed = orch
        .sync(&apqp_sync::SyncRequest {
            allow_deletions: true,
            ..request(FORWARD, SyncPolicy::SourceWins)
        })
        .await
        .expect("sync");
    assert_eq!(allowed.outcome, SyncOutcome::Success);
    assert_eq!(allowed.removed, 2);
    assert!(allowed.pending_conflict_ids.is_empty());
    assert_eq!(load(orch.store(), DocumentKind::ControlPlan).tree.len(), 1);
}

#[tokio::test]
async fn target_only_descendants_count_toward_the_removal_gate() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    tick();
    orch.store()
        .upsert_node(
            &key(),
            DocumentKind::ControlPlan,
            &node("PRJ-CM-P001-D001-CI001-01", DocumentKind::ControlPlan, &[("method", "gauge R&R")]),
        )
        .expect("control method");
    orch.store()
        .remove_subtree(&key(), DocumentKind::Pfmea, &NodeId::from(WORK_ELEMENT))
        .expect("remove");

    let response = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("sync");
    assert_eq!(response.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(response.conflicts[0].kind, ConflictKind::StructuralRemove);
    assert_eq!(load(orch.store(), DocumentKind::ControlPlan).tree.len(), 4);
}

#[tokio::test]
async fn ordinal_change_is_reported_as_move() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    let mut moved = weld_pfmea()[1].clone();
    moved.ordinal = 2;
    orch.store()
        .upsert_node(&key(), DocumentKind::Pfmea, &moved)
        .expect("reorder");

    let manual = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(manual.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(manual.conflicts[0].kind, ConflictKind::StructuralMove);

    let applied = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("sync");
    assert_eq!(applied.outcome, SyncOutcome::Success);
    assert_eq!(applied.updated, 1);
    let cp = load(orch.store(), DocumentKind::ControlPlan);
    assert_eq!(cp.tree.get(&NodeId::from(DETECTOR)).map(|n| n.ordinal), Some(2));
}

#[tokio::test]
async fn reverse_sync_after_forward_sync_is_a_no_op() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;

    let back = orch
        .sync(&request(BACKWARD, SyncPolicy::ManualOnly))
        .await
        .expect("reverse sync");
    assert_eq!(back.outcome, SyncOutcome::Success);
    assert_eq!((back.added, back.updated, back.removed), (0, 0, 0));
    assert!(back.conflicts.is_empty());
    // The failure mode row is untouched.
    assert_eq!(load(orch.store(), DocumentKind::Pfmea).tree.len(), 4);
}

#[tokio::test]
async fn mapping_there_and_back_preserves_structure() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    let pfmea = load(orch.store(), DocumentKind::Pfmea).tree;
    let cp = load(orch.store(), DocumentKind::ControlPlan).tree;

    let back = map_to_target(&cp, BACKWARD).expect("map back").tree;
    let forward_again = map_to_target(&back, FORWARD).expect("map forward").tree;
    assert_eq!(forward_again.ids(), cp.ids());

    for node in back.iter() {
        let original = pfmea.get(&node.id).expect("node survives round trip");
        assert_eq!(node.parent, original.parent);
        assert_eq!(node.ordinal, original.ordinal);
        for (name, value) in &node.fields {
            assert_eq!(original.field(name), Some(value.as_str()));
        }
    }
}

#[tokio::test]
async fn dry_run_applies_and_logs_nothing() {
    let home = TempDir::new().expect("home");
    let orch = sqlite_orchestrator(&home).await;
    orch.store()
        .replace_document(&key(), DocumentKind::Pfmea, weld_pfmea())
        .expect("seed");

    let response = orch
        .sync(&apqp_sync::SyncRequest {
            dry_run: true,
            ..request(FORWARD, SyncPolicy::SourceWins)
        })
        .await
        .expect("dry run");
    assert!(response.dry_run);
    assert_eq!(response.added, 3);
    assert_eq!(response.log_seq, None);

    assert!(load(orch.store(), DocumentKind::ControlPlan).tree.is_empty());
    assert!(log(orch.store().as_ref()).is_empty());
    let state = orch.store().load_sync_state(&key(), FORWARD).expect("state");
    assert!(state.watermark.is_none());
}

#[tokio::test]
async fn watermark_advances_per_direction() {
    let home = TempDir::new().expect("home");
    let orch = synced_once(&home).await;
    orch.sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("again");

    let store = orch.store();
    let forward = store.load_sync_state(&key(), FORWARD).expect("state");
    assert_eq!(forward.watermark.map(|w| w.version), Some(2));
    let backward = store.load_sync_state(&key(), BACKWARD).expect("state");
    assert!(backward.watermark.is_none());
}
