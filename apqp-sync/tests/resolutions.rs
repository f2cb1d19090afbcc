mod common;

use std::time::Duration;

use apqp_core::types::{
    ConflictId, ConflictKind, ConflictResolution, DocumentKind, LogOperation, NodeId,
    ResolutionOutcome, SyncOutcome, SyncPolicy,
};
use apqp_sync::{SqliteStore, SyncOrchestrator};
use chrono::Utc;
use tempfile::TempDir;

use common::*;

const DETECTOR: &str = "PRJ-D-P001-001";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Synced once, then the detection method diverged on both sides is pending.
async fn with_pending_divergence(home: &TempDir) -> (SyncOrchestrator<SqliteStore>, ConflictId) {
    let orch = sqlite_orchestrator(home).await;
    orch.store()
        .replace_document(&key(), DocumentKind::Pfmea, weld_pfmea())
        .expect("seed");
    orch.sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("first sync");
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("visual (updated)"))
        .expect("edit");
    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(response.pending_conflict_ids.len(), 1);
    let id = response.pending_conflict_ids[0].clone();
    (orch, id)
}

fn decision(id: &ConflictId, outcome: ResolutionOutcome, value: Option<&str>) -> ConflictResolution {
    ConflictResolution {
        conflict_id: id.clone(),
        outcome,
        value: value.map(str::to_string),
        resolver: "dana".to_string(),
        resolved_at: Utc::now(),
    }
}

#[tokio::test]
async fn keep_target_is_remembered_until_a_side_changes() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;

    let result = orch
        .submit_resolutions(&key(), vec![decision(&id, ResolutionOutcome::KeepTarget, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(result.applied, 1);
    assert!(result.rejected.is_empty());
    assert!(result.remaining_pending.is_empty());

    let quiet = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(quiet.outcome, SyncOutcome::Success);
    assert!(quiet.pending_conflict_ids.is_empty());
    assert_eq!(quiet.conflicts.len(), 1);
    assert_eq!(quiet.conflicts[0].resolution, Some(ResolutionOutcome::KeepTarget));
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual (updated)")
    );

    orch.store()
        .set_field(&key(), DocumentKind::Pfmea, &NodeId::from("PRJ-WE-P001-001"), "detection_method", Some("borescope"))
        .expect("source edit");
    let raised = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(raised.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(raised.pending_conflict_ids, vec![id]);
}

#[tokio::test]
async fn manual_value_is_written_and_not_asked_again() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;

    let result = orch
        .submit_resolutions(
            &key(),
            vec![decision(&id, ResolutionOutcome::ManualValue, Some("visual + gauge"))],
            TIMEOUT,
        )
        .await
        .expect("submit");
    assert_eq!(result.applied, 1);
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual + gauge")
    );

    let quiet = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(quiet.outcome, SyncOutcome::Success);
    assert!(quiet.pending_conflict_ids.is_empty());
}

#[tokio::test]
async fn keep_source_takes_the_incoming_value() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;

    orch.submit_resolutions(&key(), vec![decision(&id, ResolutionOutcome::KeepSource, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual")
    );

    let after = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(after.outcome, SyncOutcome::Success);
    assert!(after.conflicts.is_empty());
}

#[tokio::test]
async fn invalid_resolutions_are_rejected_individually() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;

    let result = orch
        .submit_resolutions(
            &key(),
            vec![
                decision(&ConflictId::from("cf-0000000000000000"), ResolutionOutcome::KeepTarget, None),
                decision(&id, ResolutionOutcome::KeepTarget, None),
                decision(&id, ResolutionOutcome::KeepSource, None),
            ],
            TIMEOUT,
        )
        .await
        .expect("submit");

    assert_eq!(result.applied, 1);
    let rejected: Vec<&str> = result.rejected.iter().map(|r| r.conflict_id.as_str()).collect();
    assert_eq!(rejected, vec!["cf-0000000000000000", id.as_str()]);
    assert!(result.remaining_pending.is_empty());
}

#[tokio::test]
async fn manual_value_is_refused_for_structural_conflicts() {
    let home = TempDir::new().expect("home");
    let (orch, _) = with_pending_divergence(&home).await;
    orch.store()
        .remove_subtree(&key(), DocumentKind::Pfmea, &NodeId::from("PRJ-WE-P001-001"))
        .expect("remove");
    let response = orch
        .sync(&request(FORWARD, SyncPolicy::SourceWins))
        .await
        .expect("sync");
    let removal = response
        .conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::StructuralRemove)
        .expect("removal conflict")
        .id
        .clone();

    let refused = orch
        .submit_resolutions(&key(), vec![decision(&removal, ResolutionOutcome::ManualValue, Some("x"))], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(refused.applied, 0);
    assert_eq!(refused.rejected.len(), 1);
    assert_eq!(refused.remaining_pending, vec![removal.clone()]);

    let accepted = orch
        .submit_resolutions(&key(), vec![decision(&removal, ResolutionOutcome::KeepSource, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(accepted.applied, 1);
    assert_eq!(load(orch.store(), DocumentKind::ControlPlan).tree.len(), 1);
}

#[tokio::test]
async fn resolutions_are_logged() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;
    orch.submit_resolutions(&key(), vec![decision(&id, ResolutionOutcome::KeepTarget, None)], TIMEOUT)
        .await
        .expect("submit");

    let entries = log(orch.store().as_ref());
    let newest = &entries[0];
    assert_eq!(newest.operation, LogOperation::Resolution);
    assert_eq!(newest.outcome, SyncOutcome::Success);
    assert_eq!(newest.conflicts.len(), 1);
    assert_eq!(newest.conflicts[0].resolution, Some(ResolutionOutcome::KeepTarget));
    assert!(entries[1..].iter().all(|e| e.operation == LogOperation::Sync));
}

#[tokio::test]
async fn manual_value_without_a_value_is_refused() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;

    let result = orch
        .submit_resolutions(&key(), vec![decision(&id, ResolutionOutcome::ManualValue, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(result.applied, 0);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].reason, "ManualValue needs a value");
    assert_eq!(result.remaining_pending, vec![id]);
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("visual (updated)")
    );
}

#[tokio::test]
async fn keep_source_refuses_to_overwrite_a_newer_edit() {
    let home = TempDir::new().expect("home");
    let (orch, id) = with_pending_divergence(&home).await;
    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("newer local edit"))
        .expect("edit");

    let result = orch
        .submit_resolutions(&key(), vec![decision(&id, ResolutionOutcome::KeepSource, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(result.applied, 0);
    assert_eq!(result.rejected[0].reason, "stale: target changed since detection");
    assert_eq!(result.remaining_pending, vec![id.clone()]);
    assert_eq!(
        field(orch.store(), DocumentKind::ControlPlan, DETECTOR, "detection_method").as_deref(),
        Some("newer local edit")
    );

    let raised = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    assert_eq!(raised.pending_conflict_ids, vec![id]);
}

#[tokio::test]
async fn keep_source_refuses_to_remove_a_subtree_edited_since_detection() {
    let home = TempDir::new().expect("home");
    let (orch, _) = with_pending_divergence(&home).await;
    orch.store()
        .remove_subtree(&key(), DocumentKind::Pfmea, &NodeId::from("PRJ-WE-P001-001"))
        .expect("remove");
    let response = orch
        .sync(&request(FORWARD, SyncPolicy::ManualOnly))
        .await
        .expect("sync");
    let removal = response
        .conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::StructuralRemove)
        .expect("removal conflict")
        .id
        .clone();

    tick();
    orch.store()
        .set_field(&key(), DocumentKind::ControlPlan, &NodeId::from(DETECTOR), "detection_method", Some("x-ray"))
        .expect("edit");
    let result = orch
        .submit_resolutions(&key(), vec![decision(&removal, ResolutionOutcome::KeepSource, None)], TIMEOUT)
        .await
        .expect("submit");
    assert_eq!(result.applied, 0);
    assert_eq!(result.rejected[0].reason, "stale: target changed since detection");
    assert!(load(orch.store(), DocumentKind::ControlPlan)
        .tree
        .contains(&NodeId::from(DETECTOR)));
}
