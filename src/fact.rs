//! Core data model for the maat fact graph.
//!
//! Facts are directed, typed edges between entities, carrying provenance
//! (source document + metadata) and a confidence score. Facts are never
//! physically deleted: a superseded fact is flipped to `is_current = false`,
//! so the graph keeps a full append-only audit trail of everything it ever
//! believed.

use std::collections::BTreeMap;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Seconds since the UNIX epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique, niche-optimized identifier for an entity.
///
/// Uses `NonZeroU64` so `Option<EntityId>` is the same size as `EntityId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(NonZeroU64);

impl EntityId {
    /// Create an `EntityId` from a raw `u64`. Returns `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EntityId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ent:{}", self.0)
    }
}

/// Unique identifier for a fact (relationship).
///
/// The `Ord` impl is the final tie-break in the deterministic fallback
/// heuristic: a total order guarantees a single winner always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FactId(NonZeroU64);

impl FactId {
    /// Create a `FactId` from a raw `u64`. Returns `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(FactId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fact:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entities and facts
// ---------------------------------------------------------------------------

/// A named node in the fact graph.
///
/// `has_conflict` and `is_unstable` are derived flags: the former is set by
/// detection and cleared by the applier, the latter refreshed by the
/// observability engine from `change_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    /// Type tag (e.g., "Person", "Organization").
    pub kind: String,
    pub created_at: u64,
    pub updated_at: u64,
    /// Monotonic count of relationship mutations touching this entity.
    pub change_count: u32,
    pub is_unstable: bool,
    pub has_conflict: bool,
}

/// A scalar metadata value attached to a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl MetaValue {
    /// Interpret the value as an epoch-seconds timestamp, if numeric.
    pub fn as_epoch_secs(&self) -> Option<u64> {
        match self {
            MetaValue::Int(v) if *v >= 0 => Some(*v as u64),
            MetaValue::Float(v) if *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Reserved metadata key carrying an explicit validity end time.
pub const META_VALID_UNTIL: &str = "valid_until";

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub subject: EntityId,
    pub predicate: String,
    pub object: EntityId,
    pub metadata: BTreeMap<String, MetaValue>,
    /// When the fact was asserted (seconds since UNIX epoch).
    pub timestamp: u64,
    /// Provenance: the document this fact was extracted from.
    pub source_document: Option<String>,
    /// Confidence in [0.0, 1.0].
    pub confidence: f32,
    /// Whether this fact is the currently believed value.
    pub is_current: bool,
    /// Whether a correction cycle has verified this fact.
    pub is_verified: bool,
}

impl Fact {
    /// Validity interval start (assertion time).
    pub fn valid_from(&self) -> u64 {
        self.timestamp
    }

    /// Validity interval end: explicit `valid_until` metadata, or open-ended
    /// (valid until superseded) when absent.
    pub fn valid_until(&self) -> u64 {
        self.metadata
            .get(META_VALID_UNTIL)
            .and_then(MetaValue::as_epoch_secs)
            .unwrap_or(u64::MAX)
    }

    /// Whether this fact's validity interval overlaps another's.
    pub fn overlaps(&self, other: &Fact) -> bool {
        self.valid_from() < other.valid_until() && other.valid_from() < self.valid_until()
    }
}

// ---------------------------------------------------------------------------
// Conflicts and decisions
// ---------------------------------------------------------------------------

/// Which detection strategy raised a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DetectionStrategy {
    /// Multiple current facts for the same (subject, exclusive predicate).
    Duplicate,
    /// Overlapping validity intervals for an exclusive predicate.
    TemporalOverlap,
    /// A current fact below the configured confidence floor.
    ConfidenceFloor,
    /// An unverified fact older than the staleness horizon.
    Staleness,
}

impl DetectionStrategy {
    /// Short prefix used in deterministic conflict ids.
    pub fn prefix(self) -> &'static str {
        match self {
            DetectionStrategy::Duplicate => "dup",
            DetectionStrategy::TemporalOverlap => "overlap",
            DetectionStrategy::ConfidenceFloor => "lowconf",
            DetectionStrategy::Staleness => "stale",
        }
    }
}

impl std::fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Conflict severity. Ordering is Low < Medium < High so merged records can
/// take the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => f.write_str("low"),
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
        }
    }
}

/// A detected semantic collision: a group of facts that cannot all be true.
///
/// The id is deterministic (`<strategy>:<subject>:<predicate>`), so
/// re-running detection on an unchanged store produces an identical set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub subject: EntityId,
    pub predicate: String,
    /// Contending fact ids, sorted ascending.
    pub facts: Vec<FactId>,
    pub strategy: DetectionStrategy,
    pub severity: Severity,
    pub detected_at: u64,
    pub resolved: bool,
    /// Error-state or missing-evidence note; never silently dropped.
    pub annotation: Option<String>,
    pub resolution: Option<CorrectionDecision>,
}

impl ConflictRecord {
    /// Deterministic conflict id for a (strategy, subject, predicate) group.
    pub fn make_id(strategy: DetectionStrategy, subject: EntityId, predicate: &str) -> String {
        format!("{}:{}:{}", strategy.prefix(), subject.get(), predicate)
    }
}

/// How a correction decision was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    /// Adjudicated by the reasoning oracle.
    Oracle,
    /// Deterministic recency/confidence/id heuristic.
    Heuristic,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionSource::Oracle => f.write_str("oracle"),
            DecisionSource::Heuristic => f.write_str("heuristic"),
        }
    }
}

/// Output of adjudicating one conflict. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionDecision {
    pub conflict_id: String,
    pub chosen: FactId,
    pub confidence: f32,
    pub reasoning: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
    pub decided_at: u64,
    pub source: DecisionSource,
}

/// Result of committing a decision to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResult {
    pub conflict_id: String,
    /// False when the decision was already applied (idempotent no-op).
    pub changed: bool,
    /// Entities whose flags or change counts were touched.
    pub entities_touched: Vec<EntityId>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Point-in-time aggregate over the fact graph. Append-only time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub total_entities: usize,
    pub total_facts: usize,
    pub conflicted_entities: usize,
    pub resolved_conflicts: usize,
    pub unresolved_conflicts: usize,
    pub unstable_entities: usize,
    pub total_tokens_used: u64,
    pub total_healing_cost: f64,
    /// Mean confidence over current facts (0.0 when there are none).
    pub average_confidence: f32,
    /// `1 - conflicted/total`, defined as 1.0 for an empty graph.
    pub data_accuracy_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: u64, ts: u64, until: Option<i64>) -> Fact {
        let mut metadata = BTreeMap::new();
        if let Some(u) = until {
            metadata.insert(META_VALID_UNTIL.to_string(), MetaValue::Int(u));
        }
        Fact {
            id: FactId::new(id).unwrap(),
            subject: EntityId::new(1).unwrap(),
            predicate: "CEO_OF".into(),
            object: EntityId::new(2).unwrap(),
            metadata,
            timestamp: ts,
            source_document: None,
            confidence: 1.0,
            is_current: true,
            is_verified: false,
        }
    }

    #[test]
    fn open_ended_intervals_overlap() {
        let a = fact(1, 100, None);
        let b = fact(2, 200, None);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn bounded_intervals_disjoint() {
        let a = fact(1, 100, Some(150));
        let b = fact(2, 200, None);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn bounded_interval_still_overlapping() {
        let a = fact(1, 100, Some(250));
        let b = fact(2, 200, None);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn conflict_id_is_deterministic() {
        let subject = EntityId::new(42).unwrap();
        let a = ConflictRecord::make_id(DetectionStrategy::Duplicate, subject, "CEO_OF");
        let b = ConflictRecord::make_id(DetectionStrategy::Duplicate, subject, "CEO_OF");
        assert_eq!(a, b);
        assert_eq!(a, "dup:42:CEO_OF");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn fact_id_total_order() {
        let a = FactId::new(1).unwrap();
        let b = FactId::new(2).unwrap();
        assert!(a < b);
    }

    #[test]
    fn meta_value_epoch_secs() {
        assert_eq!(MetaValue::Int(100).as_epoch_secs(), Some(100));
        assert_eq!(MetaValue::Int(-1).as_epoch_secs(), None);
        assert_eq!(MetaValue::Str("2024".into()).as_epoch_secs(), None);
    }
}
