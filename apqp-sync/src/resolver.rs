//! Conflict Resolver: applies a per-request policy to detected conflicts.
//!
//! - `StructuralAdd` is non-destructive and always resolves to the source.
//! - A remembered human decision (acknowledgement) whose recorded values still
//!   match resolves the conflict in favour of the target.
//! - `StructuralRemove` under `SourceWins` resolves only with `allow_deletions`.
//! - Everything else follows the policy; `ManualOnly` leaves it pending.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use apqp_core::types::{
    Acknowledgement, ConflictId, ConflictKind, ConflictResolution, ResolutionOutcome,
    SyncConflict, SyncPolicy,
};

/// A conflict together with the decision taken for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub conflict: SyncConflict,
    pub resolution: ConflictResolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverOutput {
    pub resolved: Vec<ResolvedConflict>,
    pub pending: Vec<SyncConflict>,
}

pub fn resolve(
    conflicts: Vec<SyncConflict>,
    policy: SyncPolicy,
    allow_deletions: bool,
    acknowledgements: &[Acknowledgement],
    resolved_at: DateTime<Utc>,
) -> ResolverOutput {
    let acks: HashMap<&ConflictId, &Acknowledgement> = acknowledgements
        .iter()
        .map(|ack| (&ack.conflict_id, ack))
        .collect();

    let mut out = ResolverOutput::default();
    for conflict in conflicts {
        let decision = if conflict.kind == ConflictKind::StructuralAdd {
            Some((ResolutionOutcome::KeepSource, "policy:always_add".to_string()))
        } else if let Some(ack) = acks
            .get(&conflict.id)
            .filter(|ack| ack.source_value == conflict.source_value && ack.target_value == conflict.target_value)
        {
            Some((
                ResolutionOutcome::KeepTarget,
                format!("ack:{}", ack.resolution.resolver),
            ))
        } else {
            policy_outcome(policy, conflict.kind, allow_deletions)
                .map(|outcome| (outcome, format!("policy:{policy}")))
        };

        match decision {
            Some((outcome, resolver)) => out.resolved.push(ResolvedConflict {
                resolution: ConflictResolution {
                    conflict_id: conflict.id.clone(),
                    outcome,
                    value: None,
                    resolver,
                    resolved_at,
                },
                conflict,
            }),
            None => out.pending.push(conflict),
        }
    }
    out
}

fn policy_outcome(
    policy: SyncPolicy,
    kind: ConflictKind,
    allow_deletions: bool,
) -> Option<ResolutionOutcome> {
    match (policy, kind) {
        (SyncPolicy::ManualOnly, _) => None,
        (SyncPolicy::TargetWins, _) => Some(ResolutionOutcome::KeepTarget),
        (SyncPolicy::SourceWins, ConflictKind::StructuralRemove) if !allow_deletions => None,
        (SyncPolicy::SourceWins, _) => Some(ResolutionOutcome::KeepSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apqp_core::types::{ConflictValue, Direction, NodeId};
    use rstest::rstest;

    fn conflict(kind: ConflictKind) -> SyncConflict {
        SyncConflict {
            id: ConflictId::from(format!("cf-{kind}")),
            direction: Direction::PfmeaToControlPlan,
            node_id: NodeId::from("PRJ-D-P001-001"),
            kind,
            field: None,
            source_value: ConflictValue::field(Some("a")),
            target_value: ConflictValue::field(Some("b")),
            detected_at: Utc::now(),
        }
    }

    fn outcome_of(
        kind: ConflictKind,
        policy: SyncPolicy,
        allow_deletions: bool,
    ) -> Option<ResolutionOutcome> {
        let out = resolve(vec![conflict(kind)], policy, allow_deletions, &[], Utc::now());
        out.resolved.first().map(|r| r.resolution.outcome)
    }

    #[rstest]
    #[case(SyncPolicy::SourceWins)]
    #[case(SyncPolicy::TargetWins)]
    #[case(SyncPolicy::ManualOnly)]
    fn adds_always_apply(#[case] policy: SyncPolicy) {
        assert_eq!(
            outcome_of(ConflictKind::StructuralAdd, policy, false),
            Some(ResolutionOutcome::KeepSource)
        );
    }

    #[rstest]
    #[case(SyncPolicy::SourceWins, false, None)]
    #[case(SyncPolicy::SourceWins, true, Some(ResolutionOutcome::KeepSource))]
    #[case(SyncPolicy::TargetWins, false, Some(ResolutionOutcome::KeepTarget))]
    #[case(SyncPolicy::ManualOnly, true, None)]
    fn removal_requires_allow_deletions(
        #[case] policy: SyncPolicy,
        #[case] allow_deletions: bool,
        #[case] expected: Option<ResolutionOutcome>,
    ) {
        assert_eq!(
            outcome_of(ConflictKind::StructuralRemove, policy, allow_deletions),
            expected
        );
    }

    #[rstest]
    #[case(SyncPolicy::SourceWins, Some(ResolutionOutcome::KeepSource))]
    #[case(SyncPolicy::TargetWins, Some(ResolutionOutcome::KeepTarget))]
    #[case(SyncPolicy::ManualOnly, None)]
    fn divergence_follows_policy(
        #[case] policy: SyncPolicy,
        #[case] expected: Option<ResolutionOutcome>,
    ) {
        assert_eq!(outcome_of(ConflictKind::FieldValueDivergence, policy, false), expected);
    }

    #[test]
    fn matching_acknowledgement_keeps_target() {
        let c = conflict(ConflictKind::FieldValueDivergence);
        let ack = Acknowledgement {
            conflict_id: c.id.clone(),
            direction: c.direction,
            source_value: c.source_value.clone(),
            target_value: c.target_value.clone(),
            resolution: ConflictResolution {
                conflict_id: c.id.clone(),
                outcome: ResolutionOutcome::KeepTarget,
                value: None,
                resolver: "dana".to_string(),
                resolved_at: Utc::now(),
            },
        };
        let out = resolve(vec![c.clone()], SyncPolicy::ManualOnly, false, &[ack.clone()], Utc::now());
        assert!(out.pending.is_empty());
        assert_eq!(out.resolved[0].resolution.resolver, "ack:dana");

        let mut changed = c;
        changed.source_value = ConflictValue::field(Some("a2"));
        let out = resolve(vec![changed], SyncPolicy::ManualOnly, false, &[ack], Utc::now());
        assert_eq!(out.pending.len(), 1);
    }
}
