//! Decision engine: turns an open conflict into a correction decision.
//!
//! Two paths produce a decision:
//!
//! - **Oracle**: the conflict's contenders are packaged into an
//!   [`AdjudicationPayload`] and sent to the reasoning oracle, with
//!   exponential backoff on transient failures. A verdict is accepted only
//!   when its self-reported confidence clears the configured minimum.
//! - **Heuristic**: a deterministic fallback that prefers the most recent
//!   claim, then the highest extraction confidence, then the smallest fact
//!   id. Costs nothing and always produces a winner.
//!
//! When the oracle is disabled the heuristic runs directly. When the oracle
//! exhausts its attempts the engine either falls back to the heuristic or
//! surfaces the exhaustion, depending on `fallback_on_exhaustion`.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DecideError, DecideResult};
use crate::fact::{now_secs, ConflictRecord, CorrectionDecision, DecisionSource, Fact, FactId};
use crate::oracle::{AdjudicationPayload, Candidate, ReasoningOracle};
use crate::store::FactStore;

/// Longest source-document excerpt shown to the oracle per candidate.
const EXCERPT_MAX_CHARS: usize = 480;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Maximum oracle attempts per conflict, including the first.
    pub attempt_cap: u32,
    /// Base delay for exponential backoff between oracle attempts.
    pub backoff_base_ms: u64,
    /// Oracle verdicts below this confidence are discarded as failed
    /// attempts.
    pub min_verdict_confidence: f32,
    /// Dollar cost per 1000 oracle tokens, for the healing-cost ledger.
    pub cost_per_1k_tokens: f64,
    /// Upper bound on simultaneous oracle calls in a batch.
    pub max_concurrent_calls: usize,
    /// After oracle exhaustion: fall back to the heuristic (true) or leave
    /// the conflict open with an annotation (false).
    pub fallback_on_exhaustion: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            attempt_cap: 3,
            backoff_base_ms: 250,
            min_verdict_confidence: 0.7,
            cost_per_1k_tokens: 0.03,
            max_concurrent_calls: 4,
            fallback_on_exhaustion: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DecisionEngine {
    config: DecisionConfig,
    /// Absent when the oracle is disabled; every conflict then heals
    /// heuristically.
    oracle: Option<Box<dyn ReasoningOracle>>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, oracle: Option<Box<dyn ReasoningOracle>>) -> Self {
        Self { config, oracle }
    }

    /// Purely heuristic engine, no oracle.
    pub fn heuristic_only(config: DecisionConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Decide one conflict. Reads the contending facts from the store, so
    /// the decision reflects their state at call time.
    pub fn decide(
        &self,
        store: &dyn FactStore,
        conflict: &ConflictRecord,
    ) -> DecideResult<CorrectionDecision> {
        let candidates = gather_candidates(store, conflict)?;

        let Some(oracle) = &self.oracle else {
            return Ok(heuristic_decision(conflict, &candidates));
        };

        let payload = build_payload(store, conflict, &candidates)?;
        let mut tokens_spent: u32 = 0;
        let mut last_failure = String::new();

        for attempt in 0..self.config.attempt_cap {
            if attempt > 0 {
                self.backoff(attempt);
            }
            match oracle.adjudicate(&payload) {
                Ok(verdict) => {
                    tokens_spent = tokens_spent.saturating_add(verdict.tokens_used);
                    let accepted = payload
                        .candidates
                        .get(verdict.chosen_index)
                        .filter(|_| verdict.confidence >= self.config.min_verdict_confidence);
                    if let Some(candidate) = accepted {
                        let chosen = candidate.fact_id;
                        let cost = tokens_spent as f64 / 1000.0 * self.config.cost_per_1k_tokens;
                        tracing::debug!(
                            conflict = %conflict.id,
                            %chosen,
                            confidence = verdict.confidence,
                            tokens = tokens_spent,
                            "oracle verdict accepted"
                        );
                        return Ok(CorrectionDecision {
                            conflict_id: conflict.id.clone(),
                            chosen,
                            confidence: verdict.confidence,
                            reasoning: verdict.reasoning,
                            tokens_used: tokens_spent,
                            cost_usd: cost,
                            decided_at: now_secs(),
                            source: DecisionSource::Oracle,
                        });
                    }
                    last_failure = format!(
                        "verdict confidence {:.2} below minimum {:.2}",
                        verdict.confidence, self.config.min_verdict_confidence
                    );
                    tracing::debug!(conflict = %conflict.id, attempt, %last_failure);
                }
                Err(failure) => {
                    last_failure = failure.to_string();
                    tracing::debug!(conflict = %conflict.id, attempt, %last_failure, "oracle attempt failed");
                    if !failure.is_retryable() {
                        break;
                    }
                }
            }
        }

        if self.config.fallback_on_exhaustion {
            tracing::info!(conflict = %conflict.id, "oracle exhausted, falling back to heuristic");
            let mut decision = heuristic_decision(conflict, &candidates);
            // Failed attempts still cost tokens.
            decision.tokens_used = tokens_spent;
            decision.cost_usd = tokens_spent as f64 / 1000.0 * self.config.cost_per_1k_tokens;
            Ok(decision)
        } else {
            Err(DecideError::OracleExhausted {
                conflict_id: conflict.id.clone(),
                attempts: self.config.attempt_cap,
                message: last_failure,
            })
        }
    }

    /// Decide a batch of conflicts, at most `max_concurrent_calls` in
    /// flight at once. Results come back in input order, one per conflict,
    /// with per-conflict failures isolated.
    pub fn decide_batch(
        &self,
        store: &dyn FactStore,
        conflicts: &[ConflictRecord],
    ) -> Vec<DecideResult<CorrectionDecision>> {
        let threads = self.config.max_concurrent_calls.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build();
        match pool {
            Ok(pool) => pool.install(|| {
                conflicts
                    .par_iter()
                    .map(|c| self.decide(store, c))
                    .collect()
            }),
            // Pool construction only fails on resource exhaustion; decide
            // serially rather than dropping the batch.
            Err(_) => conflicts.iter().map(|c| self.decide(store, c)).collect(),
        }
    }

    fn backoff(&self, attempt: u32) {
        if self.config.backoff_base_ms == 0 {
            return;
        }
        let base = self.config.backoff_base_ms;
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=base);
        std::thread::sleep(std::time::Duration::from_millis(delay + jitter));
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("oracle", &self.oracle.as_ref().map(|o| o.name()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Candidates, payload, heuristic
// ---------------------------------------------------------------------------

/// Load the conflict's contending facts, most recent first with the fact
/// id as final tie-break.
///
/// A candidate without a source document makes the whole conflict
/// unresolvable, on the oracle path and the heuristic path alike.
fn gather_candidates(
    store: &dyn FactStore,
    conflict: &ConflictRecord,
) -> DecideResult<Vec<Fact>> {
    if conflict.facts.is_empty() {
        return Err(DecideError::EmptyConflict {
            conflict_id: conflict.id.clone(),
        });
    }
    let mut candidates = Vec::with_capacity(conflict.facts.len());
    for fact_id in &conflict.facts {
        let fact = store
            .fact(*fact_id)?
            .ok_or_else(|| DecideError::MissingEvidence {
                conflict_id: conflict.id.clone(),
                fact_id: fact_id.get(),
            })?;
        if fact.source_document.is_none() {
            return Err(DecideError::MissingEvidence {
                conflict_id: conflict.id.clone(),
                fact_id: fact.id.get(),
            });
        }
        candidates.push(fact);
    }
    candidates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
    Ok(candidates)
}

fn build_payload(
    store: &dyn FactStore,
    conflict: &ConflictRecord,
    candidates: &[Fact],
) -> DecideResult<AdjudicationPayload> {
    let entity_name = store
        .entity(conflict.subject)?
        .map(|e| e.name)
        .unwrap_or_else(|| conflict.subject.to_string());

    let mut payload_candidates = Vec::with_capacity(candidates.len());
    for fact in candidates {
        let source =
            fact.source_document
                .as_deref()
                .ok_or_else(|| DecideError::MissingEvidence {
                    conflict_id: conflict.id.clone(),
                    fact_id: fact.id.get(),
                })?;
        let object = store
            .entity(fact.object)?
            .map(|e| e.name)
            .unwrap_or_else(|| fact.object.to_string());
        payload_candidates.push(Candidate {
            fact_id: fact.id,
            object,
            timestamp: fact.timestamp,
            confidence: fact.confidence,
            source_excerpt: truncate_excerpt(source),
        });
    }

    Ok(AdjudicationPayload {
        conflict_id: conflict.id.clone(),
        entity_name,
        predicate: conflict.predicate.clone(),
        candidates: payload_candidates,
    })
}

fn truncate_excerpt(source: &str) -> String {
    if source.chars().count() <= EXCERPT_MAX_CHARS {
        source.to_string()
    } else {
        source.chars().take(EXCERPT_MAX_CHARS).collect()
    }
}

/// Deterministic fallback. `candidates` is already sorted most recent
/// first with fact id as tie-break, so a stable scan finds the winner.
fn heuristic_decision(conflict: &ConflictRecord, candidates: &[Fact]) -> CorrectionDecision {
    let newest = candidates[0].timestamp;
    let winner = candidates
        .iter()
        .filter(|f| f.timestamp == newest)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.id.cmp(&a.id))
        })
        .unwrap_or(&candidates[0]);

    CorrectionDecision {
        conflict_id: conflict.id.clone(),
        chosen: winner.id,
        confidence: winner.confidence,
        reasoning: format!(
            "heuristic: most recent claim (recorded_at {}) with highest extraction confidence",
            winner.timestamp
        ),
        tokens_used: 0,
        cost_usd: 0.0,
        decided_at: now_secs(),
        source: DecisionSource::Heuristic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{DetectionStrategy, Severity};
    use crate::oracle::{OracleFailure, OracleVerdict, ScriptedOracle};
    use crate::store::mem::MemStore;
    use crate::store::NewFact;
    use std::collections::BTreeMap;

    const NOW: u64 = 1_700_000_000;

    fn fast_config() -> DecisionConfig {
        DecisionConfig {
            backoff_base_ms: 0,
            ..Default::default()
        }
    }

    struct Fixture {
        store: MemStore,
        conflict: ConflictRecord,
        old_fact: FactId,
        new_fact: FactId,
    }

    /// Two current CEO_OF claims: an older high-confidence one and a newer
    /// lower-confidence one.
    fn fixture() -> Fixture {
        let store = MemStore::new();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        let john = store.upsert_entity("John", "Person").unwrap();
        let jane = store.upsert_entity("Jane", "Person").unwrap();
        let old_fact = store
            .create_fact(NewFact {
                subject: corp,
                predicate: "HAS_CEO".into(),
                object: john,
                metadata: BTreeMap::new(),
                source_document: Some("2023 annual report: John is CEO".into()),
                confidence: 0.95,
                timestamp: NOW - 10_000,
            })
            .unwrap();
        let new_fact = store
            .create_fact(NewFact {
                subject: corp,
                predicate: "HAS_CEO".into(),
                object: jane,
                metadata: BTreeMap::new(),
                source_document: Some("2024 press release: Jane appointed CEO".into()),
                confidence: 0.80,
                timestamp: NOW,
            })
            .unwrap();
        let conflict = ConflictRecord {
            id: ConflictRecord::make_id(DetectionStrategy::Duplicate, corp, "HAS_CEO"),
            subject: corp,
            predicate: "HAS_CEO".into(),
            facts: vec![old_fact, new_fact],
            strategy: DetectionStrategy::Duplicate,
            severity: Severity::Medium,
            detected_at: NOW,
            resolved: false,
            annotation: None,
            resolution: None,
        };
        Fixture {
            store,
            conflict,
            old_fact,
            new_fact,
        }
    }

    fn verdict(index: usize, confidence: f32) -> OracleVerdict {
        OracleVerdict {
            chosen_index: index,
            confidence,
            reasoning: "test".into(),
            tokens_used: 100,
        }
    }

    #[test]
    fn heuristic_prefers_most_recent() {
        let fx = fixture();
        let engine = DecisionEngine::heuristic_only(fast_config());
        let decision = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(decision.chosen, fx.new_fact);
        assert_eq!(decision.source, DecisionSource::Heuristic);
        assert_eq!(decision.tokens_used, 0);
        assert_eq!(decision.cost_usd, 0.0);
    }

    #[test]
    fn heuristic_is_deterministic() {
        let fx = fixture();
        let engine = DecisionEngine::heuristic_only(fast_config());
        let a = engine.decide(&fx.store, &fx.conflict).unwrap();
        let b = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(a.chosen, b.chosen);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn oracle_verdict_accepted_above_threshold() {
        let fx = fixture();
        // Candidates are sorted newest first, so index 0 is the new fact.
        let oracle = ScriptedOracle::new([Ok(verdict(1, 0.9))]);
        let engine = DecisionEngine::new(fast_config(), Some(Box::new(oracle)));
        let decision = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(decision.chosen, fx.old_fact);
        assert_eq!(decision.source, DecisionSource::Oracle);
        assert_eq!(decision.tokens_used, 100);
        assert!((decision.cost_usd - 100.0 / 1000.0 * 0.03).abs() < 1e-9);
    }

    #[test]
    fn low_confidence_verdict_retries_then_falls_back() {
        let fx = fixture();
        let oracle = ScriptedOracle::new([
            Ok(verdict(0, 0.4)),
            Ok(verdict(0, 0.5)),
            Ok(verdict(0, 0.6)),
        ]);
        let engine = DecisionEngine::new(fast_config(), Some(Box::new(oracle)));
        let decision = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
        assert_eq!(decision.chosen, fx.new_fact);
        // Three rejected verdicts still spent tokens.
        assert_eq!(decision.tokens_used, 300);
    }

    #[test]
    fn transient_failure_retries_to_success() {
        let fx = fixture();
        let oracle = ScriptedOracle::new([
            Err(OracleFailure::Transient {
                message: "flake".into(),
            }),
            Ok(verdict(0, 0.95)),
        ]);
        let engine = DecisionEngine::new(fast_config(), Some(Box::new(oracle)));
        let decision = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(decision.source, DecisionSource::Oracle);
        assert_eq!(decision.chosen, fx.new_fact);
    }

    #[test]
    fn permanent_failure_skips_remaining_attempts() {
        let fx = fixture();
        let oracle = ScriptedOracle::new([Err(OracleFailure::Permanent {
            message: "bad model".into(),
        })]);
        let engine = DecisionEngine::new(fast_config(), Some(Box::new(oracle)));
        let decision = engine.decide(&fx.store, &fx.conflict).unwrap();
        assert_eq!(decision.source, DecisionSource::Heuristic);
    }

    #[test]
    fn exhaustion_without_fallback_is_an_error() {
        let fx = fixture();
        let oracle = ScriptedOracle::new(std::iter::repeat_with(|| {
            Err(OracleFailure::Transient {
                message: "down".into(),
            })
        })
        .take(3)
        .collect::<Vec<_>>());
        let config = DecisionConfig {
            fallback_on_exhaustion: false,
            ..fast_config()
        };
        let engine = DecisionEngine::new(config, Some(Box::new(oracle)));
        let err = engine.decide(&fx.store, &fx.conflict).unwrap_err();
        assert!(matches!(err, DecideError::OracleExhausted { attempts: 3, .. }));
    }

    #[test]
    fn missing_source_document_is_unresolvable() {
        let store = MemStore::new();
        let corp = store.upsert_entity("TechCorp", "Organization").unwrap();
        let john = store.upsert_entity("John", "Person").unwrap();
        let fact = store
            .create_fact(NewFact {
                subject: corp,
                predicate: "HAS_CEO".into(),
                object: john,
                metadata: BTreeMap::new(),
                source_document: None,
                confidence: 0.3,
                timestamp: NOW,
            })
            .unwrap();
        let conflict = ConflictRecord {
            id: ConflictRecord::make_id(DetectionStrategy::ConfidenceFloor, corp, "HAS_CEO"),
            subject: corp,
            predicate: "HAS_CEO".into(),
            facts: vec![fact],
            strategy: DetectionStrategy::ConfidenceFloor,
            severity: Severity::Low,
            detected_at: NOW,
            resolved: false,
            annotation: None,
            resolution: None,
        };
        let oracle = ScriptedOracle::new([Ok(verdict(0, 0.9))]);
        let engine = DecisionEngine::new(fast_config(), Some(Box::new(oracle)));
        let err = engine.decide(&store, &conflict).unwrap_err();
        assert!(matches!(err, DecideError::MissingEvidence { .. }));

        // The heuristic path demands evidence too.
        let engine = DecisionEngine::heuristic_only(fast_config());
        assert!(matches!(
            engine.decide(&store, &conflict).unwrap_err(),
            DecideError::MissingEvidence { .. }
        ));
    }

    #[test]
    fn empty_conflict_rejected() {
        let fx = fixture();
        let empty = ConflictRecord {
            facts: vec![],
            ..fx.conflict
        };
        let engine = DecisionEngine::heuristic_only(fast_config());
        assert!(matches!(
            engine.decide(&fx.store, &empty).unwrap_err(),
            DecideError::EmptyConflict { .. }
        ));
    }

    #[test]
    fn batch_preserves_order_and_isolates_failures() {
        let fx = fixture();
        let empty = ConflictRecord {
            id: "dup:999:NONE".into(),
            facts: vec![],
            ..fx.conflict.clone()
        };
        let engine = DecisionEngine::heuristic_only(fast_config());
        let results = engine.decide_batch(&fx.store, &[fx.conflict.clone(), empty]);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
