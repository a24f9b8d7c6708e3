//! In-memory fact store with dual-indexing.
//!
//! Uses `petgraph` for the entity adjacency structure and `DashMap` for
//! O(1) lookups by id and name. This is the substitutable implementation
//! behind [`FactStore`]: production deployments point the same trait at a
//! remote graph database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use dashmap::DashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{StoreError, StoreResult};
use crate::fact::{
    now_secs, ConflictRecord, CorrectionDecision, Entity, EntityId, Fact, FactId,
};
use crate::store::{FactStore, GraphSnapshot, NewFact, WriteOp};

/// In-memory [`FactStore`] backed by petgraph with dual-indexing.
pub struct MemStore {
    entities: DashMap<EntityId, Entity>,
    /// Entity name → id, for upsert-by-name.
    name_index: DashMap<String, EntityId>,
    facts: DashMap<FactId, Fact>,
    /// Adjacency: nodes are entities, edges carry the fact id.
    graph: RwLock<DiGraph<EntityId, FactId>>,
    node_index: DashMap<EntityId, NodeIndex>,
    conflicts: DashMap<String, ConflictRecord>,
    /// Resolution-ordered decision ledger.
    decisions: RwLock<Vec<CorrectionDecision>>,
    next_entity: AtomicU64,
    next_fact: AtomicU64,
    /// Serializes transactions so validation and mutation are atomic.
    txn_lock: Mutex<()>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            name_index: DashMap::new(),
            facts: DashMap::new(),
            graph: RwLock::new(DiGraph::new()),
            node_index: DashMap::new(),
            conflicts: DashMap::new(),
            decisions: RwLock::new(Vec::new()),
            next_entity: AtomicU64::new(1),
            next_fact: AtomicU64::new(1),
            txn_lock: Mutex::new(()),
        }
    }

    fn ensure_node(&self, entity: EntityId) -> NodeIndex {
        if let Some(idx) = self.node_index.get(&entity) {
            return *idx.value();
        }
        let mut graph = self.graph.write().expect("graph lock poisoned");
        if let Some(idx) = self.node_index.get(&entity) {
            return *idx.value();
        }
        let idx = graph.add_node(entity);
        self.node_index.insert(entity, idx);
        idx
    }

    /// Validate one write op without mutating anything.
    fn validate_op(&self, op: &WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::SetFactState { fact, .. } => {
                if !self.facts.contains_key(fact) {
                    return Err(StoreError::FactNotFound {
                        fact_id: fact.get(),
                    });
                }
            }
            WriteOp::BumpChangeCount { entity }
            | WriteOp::SetConflictFlag { entity, .. }
            | WriteOp::SetUnstable { entity, .. } => {
                if !self.entities.contains_key(entity) {
                    return Err(StoreError::EntityNotFound {
                        entity_id: entity.get(),
                    });
                }
            }
            WriteOp::ResolveConflict { conflict, .. } => {
                if !self.conflicts.contains_key(conflict) {
                    return Err(StoreError::ConflictNotFound {
                        conflict_id: conflict.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_op(&self, op: &WriteOp) {
        match op {
            WriteOp::SetFactState {
                fact,
                is_current,
                confidence,
                is_verified,
            } => {
                if let Some(mut f) = self.facts.get_mut(fact) {
                    f.is_current = *is_current;
                    if let Some(c) = confidence {
                        f.confidence = c.clamp(0.0, 1.0);
                    }
                    if let Some(v) = is_verified {
                        f.is_verified = *v;
                    }
                }
            }
            WriteOp::BumpChangeCount { entity } => {
                if let Some(mut e) = self.entities.get_mut(entity) {
                    e.change_count += 1;
                    e.updated_at = now_secs();
                }
            }
            WriteOp::SetConflictFlag { entity, flag } => {
                if let Some(mut e) = self.entities.get_mut(entity) {
                    e.has_conflict = *flag;
                }
            }
            WriteOp::SetUnstable { entity, flag } => {
                if let Some(mut e) = self.entities.get_mut(entity) {
                    e.is_unstable = *flag;
                }
            }
            WriteOp::ResolveConflict { conflict, decision } => {
                if let Some(mut c) = self.conflicts.get_mut(conflict) {
                    c.resolved = true;
                    c.resolution = Some(decision.clone());
                }
                self.decisions
                    .write()
                    .expect("decision ledger lock poisoned")
                    .push(decision.clone());
            }
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore for MemStore {
    fn upsert_entity(&self, name: &str, kind: &str) -> StoreResult<EntityId> {
        if let Some(id) = self.name_index.get(name) {
            let id = *id.value();
            if let Some(mut e) = self.entities.get_mut(&id) {
                e.change_count += 1;
                e.updated_at = now_secs();
            }
            return Ok(id);
        }

        let raw = self.next_entity.fetch_add(1, Ordering::Relaxed);
        let id = EntityId::new(raw).ok_or(StoreError::EntityNotFound { entity_id: raw })?;
        let now = now_secs();
        self.entities.insert(
            id,
            Entity {
                id,
                name: name.to_string(),
                kind: kind.to_string(),
                created_at: now,
                updated_at: now,
                change_count: 0,
                is_unstable: false,
                has_conflict: false,
            },
        );
        self.name_index.insert(name.to_string(), id);
        self.ensure_node(id);
        Ok(id)
    }

    fn create_fact(&self, new: NewFact) -> StoreResult<FactId> {
        for endpoint in [new.subject, new.object] {
            if !self.entities.contains_key(&endpoint) {
                return Err(StoreError::EntityNotFound {
                    entity_id: endpoint.get(),
                });
            }
        }

        let raw = self.next_fact.fetch_add(1, Ordering::Relaxed);
        let id = FactId::new(raw).ok_or(StoreError::FactNotFound { fact_id: raw })?;
        let fact = Fact {
            id,
            subject: new.subject,
            predicate: new.predicate,
            object: new.object,
            metadata: new.metadata,
            timestamp: new.timestamp,
            source_document: new.source_document,
            confidence: new.confidence.clamp(0.0, 1.0),
            is_current: true,
            is_verified: false,
        };

        let subj_idx = self.ensure_node(fact.subject);
        let obj_idx = self.ensure_node(fact.object);
        {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            graph.add_edge(subj_idx, obj_idx, id);
        }
        self.facts.insert(id, fact);
        Ok(id)
    }

    fn entity(&self, id: EntityId) -> StoreResult<Option<Entity>> {
        Ok(self.entities.get(&id).map(|e| e.value().clone()))
    }

    fn fact(&self, id: FactId) -> StoreResult<Option<Fact>> {
        Ok(self.facts.get(&id).map(|f| f.value().clone()))
    }

    fn snapshot(&self) -> StoreResult<GraphSnapshot> {
        // Hold the transaction lock so a concurrent commit cannot interleave
        // with the read.
        let _guard = self.txn_lock.lock().expect("txn lock poisoned");
        let mut entities: Vec<Entity> =
            self.entities.iter().map(|e| e.value().clone()).collect();
        entities.sort_by_key(|e| e.id);
        let mut facts: Vec<Fact> = self.facts.iter().map(|f| f.value().clone()).collect();
        facts.sort_by_key(|f| f.id);
        Ok(GraphSnapshot {
            taken_at: now_secs(),
            entities,
            facts,
        })
    }

    fn facts_from(&self, entity: EntityId) -> StoreResult<Vec<Fact>> {
        let graph = self.graph.read().expect("graph lock poisoned");
        let idx = match self.node_index.get(&entity) {
            Some(idx) => *idx.value(),
            None => return Ok(vec![]),
        };
        let mut facts: Vec<Fact> = graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|e| self.facts.get(e.weight()).map(|f| f.value().clone()))
            .collect();
        facts.sort_by_key(|f| f.id);
        Ok(facts)
    }

    fn mark_conflicts(&self, entities: &[EntityId]) -> StoreResult<()> {
        for id in entities {
            match self.entities.get_mut(id) {
                Some(mut e) => e.has_conflict = true,
                None => {
                    return Err(StoreError::EntityNotFound {
                        entity_id: id.get(),
                    })
                }
            }
        }
        Ok(())
    }

    fn log_conflict(&self, record: &ConflictRecord) -> StoreResult<bool> {
        // Re-detection of an already-resolved contention stays closed; the
        // same id with a different fact set is fresh contention and opens
        // anew. Drop the read guard before inserting into the same shard.
        let keep_closed = self
            .conflicts
            .get(&record.id)
            .map(|existing| existing.resolved && existing.facts == record.facts)
            .unwrap_or(false);
        if !keep_closed {
            self.conflicts.insert(record.id.clone(), record.clone());
        }
        Ok(!keep_closed)
    }

    fn open_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        let mut open: Vec<ConflictRecord> = self
            .conflicts
            .iter()
            .filter(|c| !c.value().resolved)
            .map(|c| c.value().clone())
            .collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(open)
    }

    fn conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        Ok(self.conflicts.get(id).map(|c| c.value().clone()))
    }

    fn annotate_conflict(&self, id: &str, note: &str) -> StoreResult<()> {
        match self.conflicts.get_mut(id) {
            Some(mut c) => {
                c.annotation = Some(note.to_string());
                Ok(())
            }
            None => Err(StoreError::ConflictNotFound {
                conflict_id: id.to_string(),
            }),
        }
    }

    fn commit(&self, writes: &[WriteOp]) -> StoreResult<()> {
        let _guard = self.txn_lock.lock().expect("txn lock poisoned");
        // Validate every op before touching anything: a rejected transaction
        // must leave the store unchanged.
        for op in writes {
            self.validate_op(op)?;
        }
        for op in writes {
            self.apply_op(op);
        }
        Ok(())
    }

    fn resolved_decisions(&self) -> StoreResult<Vec<CorrectionDecision>> {
        Ok(self
            .decisions
            .read()
            .expect("decision ledger lock poisoned")
            .clone())
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("entities", &self.entities.len())
            .field("facts", &self.facts.len())
            .field("conflicts", &self.conflicts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{DetectionStrategy, Severity};
    use std::collections::BTreeMap;

    fn new_fact(subject: EntityId, object: EntityId) -> NewFact {
        NewFact {
            subject,
            predicate: "CEO_OF".into(),
            object,
            metadata: BTreeMap::new(),
            source_document: Some("doc-1".into()),
            confidence: 0.9,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn upsert_twice_bumps_change_count() {
        let store = MemStore::new();
        let a = store.upsert_entity("TechCorp", "Organization").unwrap();
        let b = store.upsert_entity("TechCorp", "Organization").unwrap();
        assert_eq!(a, b);
        let entity = store.entity(a).unwrap().unwrap();
        assert_eq!(entity.change_count, 1);
    }

    #[test]
    fn create_fact_requires_endpoints() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        let missing = EntityId::new(999).unwrap();
        let err = store.create_fact(new_fact(john, missing)).unwrap_err();
        assert!(matches!(err, StoreError::EntityNotFound { .. }));
    }

    #[test]
    fn facts_from_follows_adjacency() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        let id = store.create_fact(new_fact(john, corp)).unwrap();

        let out = store.facts_from(john).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, id);
        assert!(store.facts_from(corp).unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        store.create_fact(new_fact(john, corp)).unwrap();
        store.create_fact(new_fact(john, corp)).unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.entities.len(), 2);
        assert_eq!(snap.facts.len(), 2);
        assert!(snap.facts[0].id < snap.facts[1].id);
    }

    #[test]
    fn rejected_transaction_changes_nothing() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        let fact = store.create_fact(new_fact(john, corp)).unwrap();

        let writes = vec![
            WriteOp::SetFactState {
                fact,
                is_current: false,
                confidence: None,
                is_verified: None,
            },
            // References a fact that does not exist, so the whole txn must fail.
            WriteOp::SetFactState {
                fact: FactId::new(999).unwrap(),
                is_current: false,
                confidence: None,
                is_verified: None,
            },
        ];
        assert!(store.commit(&writes).is_err());
        assert!(store.fact(fact).unwrap().unwrap().is_current);
    }

    #[test]
    fn resolved_conflict_is_not_reopened() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        let fact = store.create_fact(new_fact(john, corp)).unwrap();

        let mut record = ConflictRecord {
            id: "dup:1:CEO_OF".into(),
            subject: john,
            predicate: "CEO_OF".into(),
            facts: vec![fact],
            strategy: DetectionStrategy::Duplicate,
            severity: Severity::Medium,
            detected_at: 1,
            resolved: false,
            annotation: None,
            resolution: None,
        };
        store.log_conflict(&record).unwrap();

        let decision = CorrectionDecision {
            conflict_id: record.id.clone(),
            chosen: fact,
            confidence: 0.9,
            reasoning: "test".into(),
            tokens_used: 0,
            cost_usd: 0.0,
            decided_at: 2,
            source: crate::fact::DecisionSource::Heuristic,
        };
        store
            .commit(&[WriteOp::ResolveConflict {
                conflict: record.id.clone(),
                decision,
            }])
            .unwrap();

        // Re-logging the same detection output must not reopen it.
        record.resolved = false;
        assert!(!store.log_conflict(&record).unwrap());
        assert!(store.conflict(&record.id).unwrap().unwrap().resolved);
        assert!(store.open_conflicts().unwrap().is_empty());
        assert_eq!(store.resolved_decisions().unwrap().len(), 1);

        // New contenders under the same id are fresh contention.
        let corp = store.upsert_entity("OtherCorp", "Organization").unwrap();
        let newer = store.create_fact(new_fact(john, corp)).unwrap();
        record.facts = vec![fact, newer];
        assert!(store.log_conflict(&record).unwrap());
        assert_eq!(store.open_conflicts().unwrap().len(), 1);
    }

    #[test]
    fn mark_conflicts_is_idempotent() {
        let store = MemStore::new();
        let john = store.upsert_entity("John", "Person").unwrap();
        store.mark_conflicts(&[john]).unwrap();
        store.mark_conflicts(&[john]).unwrap();
        assert!(store.entity(john).unwrap().unwrap().has_conflict);
    }
}
