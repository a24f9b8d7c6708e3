//! Fact store contract and implementations.
//!
//! The persistent graph store is an external collaborator; this module pins
//! down the narrow contract the engine relies on. Each trait method covers
//! exactly one access pattern used by detection, decision, apply, or
//! observability, with no generic query passthrough, so a substitutable
//! in-memory implementation ([`mem::MemStore`]) can back the test suite.

pub mod mem;
pub mod metrics_log;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::fact::{
    ConflictRecord, CorrectionDecision, Entity, EntityId, Fact, FactId, MetaValue,
};

/// Input for creating a new fact. The store assigns the id and flips the
/// fact to `is_current = true`, `is_verified = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFact {
    pub subject: EntityId,
    pub predicate: String,
    pub object: EntityId,
    pub metadata: BTreeMap<String, MetaValue>,
    pub source_document: Option<String>,
    pub confidence: f32,
    /// Assertion time (seconds since UNIX epoch).
    pub timestamp: u64,
}

/// A consistent read of the whole graph, taken at cycle start.
///
/// Detection strategies are pure functions over a snapshot, which is what
/// makes detection deterministic and idempotent: the same snapshot always
/// yields the same conflict set.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub taken_at: u64,
    pub entities: Vec<Entity>,
    pub facts: Vec<Fact>,
}

impl GraphSnapshot {
    /// All facts with `is_current = true`.
    pub fn current_facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter().filter(|f| f.is_current)
    }

    /// All facts (current or superseded) for a (subject, predicate) pair.
    pub fn facts_of<'a>(
        &'a self,
        subject: EntityId,
        predicate: &'a str,
    ) -> impl Iterator<Item = &'a Fact> {
        self.facts
            .iter()
            .filter(move |f| f.subject == subject && f.predicate == predicate)
    }

    /// Look up an entity by id.
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }
}

/// A single write in an all-or-nothing transaction.
///
/// Only the correction applier issues these; a rejected transaction leaves
/// every fact untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Update a fact's current/verified flags and optionally its confidence.
    SetFactState {
        fact: FactId,
        is_current: bool,
        confidence: Option<f32>,
        is_verified: Option<bool>,
    },
    /// Increment an entity's monotonic change count.
    BumpChangeCount { entity: EntityId },
    /// Set or clear an entity's derived conflict flag.
    SetConflictFlag { entity: EntityId, flag: bool },
    /// Set or clear an entity's derived instability flag.
    SetUnstable { entity: EntityId, flag: bool },
    /// Close a conflict record and link its resolution decision.
    ResolveConflict {
        conflict: String,
        decision: CorrectionDecision,
    },
}

/// Typed access to the fact graph: one method per access pattern.
pub trait FactStore: Send + Sync {
    /// Create an entity, or bump `change_count`/`updated_at` if one with
    /// this name already exists. Returns the entity id either way.
    fn upsert_entity(&self, name: &str, kind: &str) -> StoreResult<EntityId>;

    /// Create a fact. Both endpoints must already exist.
    fn create_fact(&self, fact: NewFact) -> StoreResult<FactId>;

    /// Look up an entity by id.
    fn entity(&self, id: EntityId) -> StoreResult<Option<Entity>>;

    /// Look up a fact by id.
    fn fact(&self, id: FactId) -> StoreResult<Option<Fact>>;

    /// Take a consistent read of all entities and facts.
    fn snapshot(&self) -> StoreResult<GraphSnapshot>;

    /// Outgoing facts of an entity (current and superseded).
    fn facts_from(&self, entity: EntityId) -> StoreResult<Vec<Fact>>;

    /// Detection mark step: set `has_conflict = true` on each entity.
    /// Idempotent and safe to repeat.
    fn mark_conflicts(&self, entities: &[EntityId]) -> StoreResult<()>;

    /// Upsert a conflict record keyed by its deterministic id. Re-logging
    /// a resolved record with the same fact set is a no-op; the same id
    /// with different contenders opens fresh contention. Returns whether
    /// the record is open after the call.
    fn log_conflict(&self, record: &ConflictRecord) -> StoreResult<bool>;

    /// All unresolved conflict records, sorted by id.
    fn open_conflicts(&self) -> StoreResult<Vec<ConflictRecord>>;

    /// Look up a conflict record by id.
    fn conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>>;

    /// Attach an error-state annotation to a conflict, leaving it open.
    fn annotate_conflict(&self, id: &str, note: &str) -> StoreResult<()>;

    /// Apply a multi-write transaction: all writes succeed or none do.
    fn commit(&self, writes: &[WriteOp]) -> StoreResult<()>;

    /// The decisions of every resolved conflict, in resolution order.
    /// Observability sums these rather than re-invoking the oracle.
    fn resolved_decisions(&self) -> StoreResult<Vec<CorrectionDecision>>;
}
