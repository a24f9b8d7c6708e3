//! Conflict detection: scans the fact graph for semantic collisions.
//!
//! Four independent strategies, each pure with respect to a
//! [`GraphSnapshot`] taken at cycle start:
//!
//! - **Duplicates**: more than one current fact for a (subject, exclusive
//!   predicate) pair
//! - **Temporal overlaps**: two facts claiming an exclusive predicate for
//!   overlapping validity intervals, even when only one is current
//! - **Confidence floor**: a current fact below the configured floor
//!   (routed through correction as self-verification)
//! - **Staleness**: unverified facts older than the horizon
//!
//! Strategy outputs are merged so each (subject, predicate) group heals at
//! most once per cycle. Detection is read-only except for the idempotent
//! mark step (`has_conflict = true` on touched entities) and the conflict
//! log upsert. Given an unchanged store, re-running detection yields an
//! identical conflict set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::fact::{ConflictRecord, DetectionStrategy, EntityId, Fact, Severity};
use crate::store::{FactStore, GraphSnapshot};

// ---------------------------------------------------------------------------
// Exclusive predicates
// ---------------------------------------------------------------------------

/// Set of predicates for which a subject may hold only one current value
/// at a time (e.g., `CEO_OF`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusivePredicates {
    predicates: HashSet<String>,
}

impl ExclusivePredicates {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a predicate as exclusive.
    pub fn declare(&mut self, predicate: impl Into<String>) {
        self.predicates.insert(predicate.into());
    }

    /// Check if a predicate is exclusive.
    pub fn is_exclusive(&self, predicate: &str) -> bool {
        self.predicates.contains(predicate)
    }

    /// Number of declared exclusive predicates.
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Whether no exclusive predicates are declared.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl FromIterator<String> for ExclusivePredicates {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            predicates: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the detection strategies. Thresholds may be tuned but the
/// rules stay deterministic: same snapshot, same severities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Current facts below this confidence are flagged for self-verification.
    pub confidence_floor: f32,
    /// Duplicate conflicts whose confidences all lie within this band are
    /// considered ambiguous and escalated to high severity.
    pub ambiguity_band: f32,
    /// Unverified facts older than this horizon are flagged stale.
    pub staleness_horizon_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            ambiguity_band: 0.05,
            staleness_horizon_secs: 30 * 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn group_by_subject_predicate<'a>(
    facts: impl Iterator<Item = &'a Fact>,
) -> BTreeMap<(EntityId, &'a str), Vec<&'a Fact>> {
    let mut groups: BTreeMap<(EntityId, &str), Vec<&Fact>> = BTreeMap::new();
    for fact in facts {
        groups
            .entry((fact.subject, fact.predicate.as_str()))
            .or_default()
            .push(fact);
    }
    groups
}

fn record(
    strategy: DetectionStrategy,
    subject: EntityId,
    predicate: &str,
    facts: &[&Fact],
    severity: Severity,
    detected_at: u64,
) -> ConflictRecord {
    let mut ids: Vec<_> = facts.iter().map(|f| f.id).collect();
    ids.sort();
    ids.dedup();
    ConflictRecord {
        id: ConflictRecord::make_id(strategy, subject, predicate),
        subject,
        predicate: predicate.to_string(),
        facts: ids,
        strategy,
        severity,
        detected_at,
        resolved: false,
        annotation: None,
        resolution: None,
    }
}

/// Duplicate-relationship strategy: more than one current fact for a
/// (subject, exclusive predicate) pair.
pub fn detect_duplicates(
    snapshot: &GraphSnapshot,
    exclusive: &ExclusivePredicates,
    config: &DetectionConfig,
) -> Vec<ConflictRecord> {
    let groups = group_by_subject_predicate(
        snapshot
            .current_facts()
            .filter(|f| exclusive.is_exclusive(&f.predicate)),
    );

    groups
        .into_iter()
        .filter(|(_, facts)| facts.len() > 1)
        .map(|((subject, predicate), facts)| {
            let severity = duplicate_severity(&facts, config.ambiguity_band);
            record(
                DetectionStrategy::Duplicate,
                subject,
                predicate,
                &facts,
                severity,
                snapshot.taken_at,
            )
        })
        .collect()
}

/// High when the contention is wide (>= 3 claims) or ambiguous (all
/// confidences within the band), else medium.
fn duplicate_severity(facts: &[&Fact], ambiguity_band: f32) -> Severity {
    if facts.len() >= 3 {
        return Severity::High;
    }
    let min = facts.iter().map(|f| f.confidence).fold(f32::MAX, f32::min);
    let max = facts.iter().map(|f| f.confidence).fold(f32::MIN, f32::max);
    if max - min <= ambiguity_band {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Temporal-overlap strategy: two facts claim an exclusive predicate for
/// overlapping validity intervals, current or not.
///
/// A fact's validity starts at its timestamp and runs until its explicit
/// `valid_until` metadata, or until superseded when none is given. A
/// superseded fact with no explicit end already ended, so it cannot
/// overlap anything.
pub fn detect_temporal_overlaps(
    snapshot: &GraphSnapshot,
    exclusive: &ExclusivePredicates,
) -> Vec<ConflictRecord> {
    let groups = group_by_subject_predicate(snapshot.facts.iter().filter(|f| {
        exclusive.is_exclusive(&f.predicate)
            && (f.is_current || f.metadata.contains_key(crate::fact::META_VALID_UNTIL))
    }));

    let mut records = Vec::new();
    for ((subject, predicate), facts) in groups {
        if facts.len() < 2 {
            continue;
        }
        let mut overlapping: BTreeMap<crate::fact::FactId, &Fact> = BTreeMap::new();
        for (i, a) in facts.iter().enumerate() {
            for b in &facts[i + 1..] {
                if a.object != b.object && a.overlaps(b) {
                    overlapping.insert(a.id, a);
                    overlapping.insert(b.id, b);
                }
            }
        }
        if overlapping.len() > 1 {
            let contending: Vec<&Fact> = overlapping.into_values().collect();
            records.push(record(
                DetectionStrategy::TemporalOverlap,
                subject,
                predicate,
                &contending,
                Severity::Medium,
                snapshot.taken_at,
            ));
        }
    }
    records
}

/// Confidence-threshold strategy: single-member conflicts for current facts
/// below the floor. Not necessarily a contradiction; routes the fact
/// through the correction pipeline for self-verification.
pub fn detect_low_confidence(
    snapshot: &GraphSnapshot,
    config: &DetectionConfig,
) -> Vec<ConflictRecord> {
    snapshot
        .current_facts()
        .filter(|f| f.confidence < config.confidence_floor)
        .map(|f| {
            record(
                DetectionStrategy::ConfidenceFloor,
                f.subject,
                &f.predicate,
                &[f],
                Severity::Low,
                snapshot.taken_at,
            )
        })
        .collect()
}

/// Staleness strategy: unverified facts not updated within the horizon.
pub fn detect_stale(snapshot: &GraphSnapshot, config: &DetectionConfig) -> Vec<ConflictRecord> {
    let cutoff = snapshot
        .taken_at
        .saturating_sub(config.staleness_horizon_secs);
    snapshot
        .current_facts()
        .filter(|f| !f.is_verified && f.timestamp < cutoff)
        .map(|f| {
            record(
                DetectionStrategy::Staleness,
                f.subject,
                &f.predicate,
                &[f],
                Severity::Low,
                snapshot.taken_at,
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge strategy outputs into one record per (subject, predicate) group.
///
/// Strategy priority follows the enum order (Duplicate first); fact sets
/// are unioned, severity takes the max, and the merged record keeps the
/// winning strategy's deterministic id. Output is sorted by id.
pub fn merge_conflicts(raised: Vec<ConflictRecord>) -> Vec<ConflictRecord> {
    let mut groups: BTreeMap<(EntityId, String), ConflictRecord> = BTreeMap::new();

    for conflict in raised {
        let key = (conflict.subject, conflict.predicate.clone());
        match groups.get_mut(&key) {
            None => {
                groups.insert(key, conflict);
            }
            Some(merged) => {
                if conflict.strategy < merged.strategy {
                    merged.strategy = conflict.strategy;
                    merged.id = ConflictRecord::make_id(
                        conflict.strategy,
                        merged.subject,
                        &merged.predicate,
                    );
                }
                merged.severity = merged.severity.max(conflict.severity);
                merged.facts.extend(conflict.facts);
                merged.facts.sort();
                merged.facts.dedup();
            }
        }
    }

    let mut merged: Vec<ConflictRecord> = groups.into_values().collect();
    merged.sort_by(|a, b| a.id.cmp(&b.id));
    merged
}

// ---------------------------------------------------------------------------
// Detection cycle
// ---------------------------------------------------------------------------

/// Run one full detection cycle against the store.
///
/// Takes a snapshot, runs all strategies, merges, and logs the records.
/// Records whose contention was already resolved stay closed in the store
/// and are dropped here; only entities touched by an open record get the
/// `has_conflict` mark, so a healed graph that still trips a strategy does
/// not re-flag forever. Returns the open conflict set.
pub fn run_detection_cycle(
    store: &dyn FactStore,
    exclusive: &ExclusivePredicates,
    config: &DetectionConfig,
) -> StoreResult<Vec<ConflictRecord>> {
    let snapshot = store.snapshot()?;

    let mut raised = Vec::new();
    raised.extend(detect_duplicates(&snapshot, exclusive, config));
    raised.extend(detect_temporal_overlaps(&snapshot, exclusive));
    raised.extend(detect_low_confidence(&snapshot, config));
    raised.extend(detect_stale(&snapshot, config));

    let merged = merge_conflicts(raised);

    let mut open = Vec::with_capacity(merged.len());
    for conflict in merged {
        if store.log_conflict(&conflict)? {
            open.push(conflict);
        }
    }

    // Mark step: flag every entity touched by an open record.
    let mut touched: BTreeSet<EntityId> = BTreeSet::new();
    for conflict in &open {
        touched.insert(conflict.subject);
        for fact_id in &conflict.facts {
            if let Some(fact) = snapshot.facts.iter().find(|f| f.id == *fact_id) {
                touched.insert(fact.object);
            }
        }
    }
    let touched: Vec<EntityId> = touched.into_iter().collect();
    store.mark_conflicts(&touched)?;

    tracing::info!(
        conflicts = open.len(),
        entities_marked = touched.len(),
        "detection cycle complete"
    );
    Ok(open)
}
