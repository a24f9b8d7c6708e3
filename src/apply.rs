//! Atomic applier: commits a correction decision to the store.
//!
//! One decision becomes one all-or-nothing transaction. The chosen fact
//! becomes the single current, verified claim; the losers are superseded;
//! touched entities get their change counters bumped and their conflict
//! flags re-derived from the remaining open conflicts; the conflict record
//! closes with the decision attached for the audit trail.
//!
//! Applying is idempotent: a decision for an already-resolved conflict is
//! a no-op, so a crashed cycle can be replayed safely.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ApplyError, ApplyResult};
use crate::fact::{AppliedResult, ConflictRecord, CorrectionDecision, EntityId, Fact};
use crate::store::{FactStore, WriteOp};

/// Apply a decision to its conflict. Returns which entities were touched
/// and whether the store actually changed.
pub fn apply(
    store: &dyn FactStore,
    conflict: &ConflictRecord,
    decision: &CorrectionDecision,
) -> ApplyResult<AppliedResult> {
    if decision.conflict_id != conflict.id {
        return Err(ApplyError::ConflictMismatch {
            conflict_id: conflict.id.clone(),
            decision_conflict: decision.conflict_id.clone(),
        });
    }
    if !conflict.facts.contains(&decision.chosen) {
        return Err(ApplyError::ChosenNotContending {
            conflict_id: conflict.id.clone(),
            chosen: decision.chosen.get(),
        });
    }

    // Replays of an already-closed conflict are no-ops.
    if let Some(stored) = store.conflict(&conflict.id)? {
        if stored.resolved {
            tracing::debug!(conflict = %conflict.id, "already resolved, skipping");
            return Ok(AppliedResult {
                conflict_id: conflict.id.clone(),
                changed: false,
                entities_touched: Vec::new(),
            });
        }
    }

    let mut contenders: BTreeMap<_, Fact> = BTreeMap::new();
    for fact_id in &conflict.facts {
        let fact = store
            .fact(*fact_id)?
            .ok_or(crate::error::StoreError::FactNotFound {
                fact_id: fact_id.get(),
            })?;
        contenders.insert(*fact_id, fact);
    }

    let mut ops = Vec::new();
    let mut touched: BTreeSet<EntityId> = BTreeSet::new();

    for (fact_id, fact) in &contenders {
        let winner = *fact_id == decision.chosen;
        let want_current = winner;
        let want_verified = winner;
        let want_confidence = if winner { decision.confidence } else { fact.confidence };

        let unchanged = fact.is_current == want_current
            && fact.is_verified == want_verified
            && fact.confidence == want_confidence;
        if unchanged {
            continue;
        }
        ops.push(WriteOp::SetFactState {
            fact: *fact_id,
            is_current: want_current,
            confidence: if winner { Some(decision.confidence) } else { None },
            is_verified: if winner { Some(true) } else { None },
        });
        touched.insert(fact.subject);
        touched.insert(fact.object);
    }

    for entity in &touched {
        ops.push(WriteOp::BumpChangeCount { entity: *entity });
    }

    // Re-derive conflict flags for every entity this conflict involves:
    // the flag stays up only while the entity appears in some other open
    // conflict.
    let mut involved: BTreeSet<EntityId> = BTreeSet::new();
    involved.insert(conflict.subject);
    for fact in contenders.values() {
        involved.insert(fact.subject);
        involved.insert(fact.object);
    }
    let still_open = entities_in_open_conflicts(store, &conflict.id)?;
    for entity in &involved {
        ops.push(WriteOp::SetConflictFlag {
            entity: *entity,
            flag: still_open.contains(entity),
        });
    }

    ops.push(WriteOp::ResolveConflict {
        conflict: conflict.id.clone(),
        decision: decision.clone(),
    });

    store.commit(&ops)?;

    tracing::info!(
        conflict = %conflict.id,
        chosen = %decision.chosen,
        source = %decision.source,
        entities = touched.len(),
        "conflict resolved"
    );

    Ok(AppliedResult {
        conflict_id: conflict.id.clone(),
        changed: true,
        entities_touched: touched.into_iter().collect(),
    })
}

/// Entities that appear in open conflicts other than `except`.
fn entities_in_open_conflicts(
    store: &dyn FactStore,
    except: &str,
) -> ApplyResult<BTreeSet<EntityId>> {
    let mut entities = BTreeSet::new();
    for open in store.open_conflicts()? {
        if open.id == except {
            continue;
        }
        entities.insert(open.subject);
        for fact_id in &open.facts {
            if let Some(fact) = store.fact(*fact_id)? {
                entities.insert(fact.subject);
                entities.insert(fact.object);
            }
        }
    }
    Ok(entities)
}
