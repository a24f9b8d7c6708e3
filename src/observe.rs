//! Observability engine: graph health as data, not dashboards.
//!
//! Everything here is derived from the store and the resolved-decision
//! ledger. Nothing re-invokes the oracle; cumulative token and cost
//! figures are sums over decisions already paid for.

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::fact::{now_secs, EntityId, MetricsSnapshot};
use crate::store::{FactStore, WriteOp};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Entities whose `change_count` reaches this are flagged unstable.
    pub instability_threshold: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            instability_threshold: 3,
        }
    }
}

/// One row of the high-risk report: an entity that is both unstable and
/// currently conflicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub entity: EntityId,
    pub name: String,
    pub change_count: u32,
    /// Average confidence of the entity's current outgoing facts; 0 when
    /// it has none.
    pub average_confidence: f32,
}

/// Compute the current health snapshot of the whole graph.
///
/// The accuracy score is the fraction of entities with no open conflict,
/// defined as 1.0 for an empty graph.
pub fn current_metrics(store: &dyn FactStore) -> StoreResult<MetricsSnapshot> {
    let snapshot = store.snapshot()?;
    let decisions = store.resolved_decisions()?;

    let total_entities = snapshot.entities.len();
    let conflicted_entities = snapshot.entities.iter().filter(|e| e.has_conflict).count();
    let unstable_entities = snapshot.entities.iter().filter(|e| e.is_unstable).count();
    let unresolved_conflicts = store.open_conflicts()?.len();

    let total_tokens_used: u64 = decisions.iter().map(|d| d.tokens_used as u64).sum();
    let total_healing_cost: f64 = decisions.iter().map(|d| d.cost_usd).sum();

    let (current_count, confidence_sum) = snapshot
        .current_facts()
        .fold((0usize, 0.0f64), |(n, sum), f| {
            (n + 1, sum + f.confidence as f64)
        });
    let average_confidence = if current_count == 0 {
        0.0
    } else {
        (confidence_sum / current_count as f64) as f32
    };

    let data_accuracy_score = if total_entities == 0 {
        1.0
    } else {
        1.0 - conflicted_entities as f64 / total_entities as f64
    };

    Ok(MetricsSnapshot {
        timestamp: now_secs(),
        total_entities,
        total_facts: snapshot.facts.len(),
        conflicted_entities,
        resolved_conflicts: decisions.len(),
        unresolved_conflicts,
        unstable_entities,
        total_tokens_used,
        total_healing_cost,
        average_confidence,
        data_accuracy_score,
    })
}

/// Refresh the derived `is_unstable` flag on every entity. Idempotent;
/// returns how many entities are flagged after the refresh.
pub fn mark_unstable_nodes(
    store: &dyn FactStore,
    config: &ObservabilityConfig,
) -> StoreResult<usize> {
    let snapshot = store.snapshot()?;
    let mut ops = Vec::new();
    let mut flagged = 0usize;
    for entity in &snapshot.entities {
        let unstable = entity.change_count >= config.instability_threshold;
        if unstable {
            flagged += 1;
        }
        if entity.is_unstable != unstable {
            ops.push(WriteOp::SetUnstable {
                entity: entity.id,
                flag: unstable,
            });
        }
    }
    if !ops.is_empty() {
        store.commit(&ops)?;
    }
    tracing::debug!(flagged, refreshed = ops.len(), "instability flags refreshed");
    Ok(flagged)
}

/// Entities that are both unstable and conflicted, riskiest first
/// (highest change count, then id).
pub fn high_risk_nodes(store: &dyn FactStore) -> StoreResult<Vec<NodeHealth>> {
    let snapshot = store.snapshot()?;
    let mut rows = Vec::new();
    for entity in snapshot
        .entities
        .iter()
        .filter(|e| e.is_unstable && e.has_conflict)
    {
        let facts = store.facts_from(entity.id)?;
        let current: Vec<_> = facts.iter().filter(|f| f.is_current).collect();
        let average_confidence = if current.is_empty() {
            0.0
        } else {
            current.iter().map(|f| f.confidence).sum::<f32>() / current.len() as f32
        };
        rows.push(NodeHealth {
            entity: entity.id,
            name: entity.name.clone(),
            change_count: entity.change_count,
            average_confidence,
        });
    }
    rows.sort_by(|a, b| {
        b.change_count
            .cmp(&a.change_count)
            .then(a.entity.cmp(&b.entity))
    });
    Ok(rows)
}
