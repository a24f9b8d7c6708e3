//! Orchestration facade tying the subsystems into healing cycles.
//!
//! A full cycle is detect, heal, refresh instability flags, then append a
//! metrics snapshot. Per-conflict failures are isolated: an unresolvable
//! conflict is annotated and left open while the rest of the batch heals.
//! Only store unavailability aborts a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MaatConfig;
use crate::decide::DecisionEngine;
use crate::detect::{self, ExclusivePredicates};
use crate::error::{ApplyError, DecideError, MaatError, MaatResult, StoreError};
use crate::fact::{ConflictRecord, MetricsSnapshot};
use crate::ingest::{self, FactInput, Ingested};
use crate::observe;
use crate::oracle::{HttpOracle, ReasoningOracle};
use crate::store::metrics_log::MetricsLog;
use crate::store::FactStore;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Seconds between scheduled full cycles.
    pub interval_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

/// Cooperative cancellation handle for [`HealingEngine::run_loop`].
/// Checked between cycles only, never mid-transaction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for wiring up signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one healing pass over the open conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealingReport {
    pub conflicts_seen: usize,
    pub healed: usize,
    /// Unresolvable conflicts, annotated and left open.
    pub skipped: usize,
    /// Conflicts that errored without being unresolvable by nature.
    pub failed: usize,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// Outcome of one full detect-heal-observe cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub conflicts_detected: usize,
    pub healing: HealingReport,
    pub unstable_entities: usize,
    pub metrics: MetricsSnapshot,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the store handle, the decision engine, and the metrics log.
pub struct HealingEngine {
    store: Arc<dyn FactStore>,
    decider: DecisionEngine,
    exclusive: ExclusivePredicates,
    config: MaatConfig,
    metrics: MetricsLog,
}

impl HealingEngine {
    /// Build an engine from config. The oracle is attached only when
    /// enabled; otherwise every conflict heals heuristically. An enabled
    /// oracle that fails the startup probe is still attached, since the
    /// decision engine retries and falls back per conflict.
    pub fn new(store: Arc<dyn FactStore>, config: MaatConfig, metrics: MetricsLog) -> Self {
        let oracle: Option<Box<dyn ReasoningOracle>> = if config.oracle.enabled {
            let http = HttpOracle::new(config.oracle.clone());
            if let Err(err) = http.probe() {
                tracing::warn!(%err, "oracle probe failed, healing will fall back to the heuristic");
            }
            Some(Box::new(http))
        } else {
            None
        };
        Self::with_oracle(store, config, metrics, oracle)
    }

    /// Build an engine with an explicit oracle (or none), bypassing the
    /// `oracle.enabled` switch. Used by tests to inject doubles.
    pub fn with_oracle(
        store: Arc<dyn FactStore>,
        config: MaatConfig,
        metrics: MetricsLog,
        oracle: Option<Box<dyn ReasoningOracle>>,
    ) -> Self {
        let exclusive: ExclusivePredicates =
            config.exclusive_predicates.iter().cloned().collect();
        let decider = DecisionEngine::new(config.decision.clone(), oracle);
        Self {
            store,
            decider,
            exclusive,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    pub fn config(&self) -> &MaatConfig {
        &self.config
    }

    pub fn metrics_log(&self) -> &MetricsLog {
        &self.metrics
    }

    /// Ingest a batch of extracted facts, one result per input.
    pub fn ingest(&self, inputs: &[FactInput]) -> Vec<Result<Ingested, StoreError>> {
        ingest::ingest_batch(self.store.as_ref(), inputs)
    }

    /// Detect and log conflicts without healing anything.
    pub fn run_detection_cycle(&self) -> MaatResult<Vec<ConflictRecord>> {
        let conflicts = detect::run_detection_cycle(
            self.store.as_ref(),
            &self.exclusive,
            &self.config.detection,
        )?;
        Ok(conflicts)
    }

    /// Heal every open conflict. Unresolvable conflicts are annotated and
    /// skipped; store unavailability aborts the whole cycle.
    pub fn run_healing_cycle(&self) -> MaatResult<HealingReport> {
        let open = self.store.open_conflicts().map_err(MaatError::from)?;
        let mut report = HealingReport {
            conflicts_seen: open.len(),
            ..Default::default()
        };

        let decisions = self.decider.decide_batch(self.store.as_ref(), &open);
        for (conflict, outcome) in open.iter().zip(decisions) {
            match outcome {
                Ok(decision) => {
                    report.tokens_used += decision.tokens_used as u64;
                    report.cost_usd += decision.cost_usd;
                    match crate::apply::apply(self.store.as_ref(), conflict, &decision) {
                        Ok(_) => report.healed += 1,
                        Err(ApplyError::Store(StoreError::Unavailable { message })) => {
                            return Err(StoreError::Unavailable { message }.into());
                        }
                        Err(err) => {
                            tracing::warn!(conflict = %conflict.id, %err, "apply failed, conflict left open");
                            report.failed += 1;
                        }
                    }
                }
                Err(DecideError::Store(StoreError::Unavailable { message })) => {
                    return Err(StoreError::Unavailable { message }.into());
                }
                Err(err) => {
                    let annotation = err.to_string();
                    match err {
                        DecideError::MissingEvidence { .. } | DecideError::EmptyConflict { .. } => {
                            report.skipped += 1;
                        }
                        _ => report.failed += 1,
                    }
                    tracing::warn!(conflict = %conflict.id, %annotation, "conflict left open");
                    self.store
                        .annotate_conflict(&conflict.id, &annotation)
                        .map_err(MaatError::from)?;
                }
            }
        }

        tracing::info!(
            seen = report.conflicts_seen,
            healed = report.healed,
            skipped = report.skipped,
            failed = report.failed,
            tokens = report.tokens_used,
            "healing cycle complete"
        );
        Ok(report)
    }

    /// One full cycle: detect, heal, refresh instability flags, append a
    /// metrics snapshot.
    pub fn run_full_cycle(&self) -> MaatResult<CycleReport> {
        let conflicts = self.run_detection_cycle()?;
        let healing = self.run_healing_cycle()?;
        let unstable =
            observe::mark_unstable_nodes(self.store.as_ref(), &self.config.observability)?;
        let metrics = observe::current_metrics(self.store.as_ref())?;
        self.metrics.append(&metrics)?;
        Ok(CycleReport {
            conflicts_detected: conflicts.len(),
            healing,
            unstable_entities: unstable,
            metrics,
        })
    }

    /// Run full cycles on the configured interval until cancelled.
    /// Returns the number of completed cycles.
    pub fn run_loop(&self, token: &CancelToken) -> MaatResult<usize> {
        let mut cycles = 0usize;
        while !token.is_cancelled() {
            let report = self.run_full_cycle()?;
            cycles += 1;
            tracing::info!(
                cycle = cycles,
                detected = report.conflicts_detected,
                healed = report.healing.healed,
                accuracy = report.metrics.data_accuracy_score,
                "cycle finished"
            );
            self.sleep_interval(token);
        }
        Ok(cycles)
    }

    /// Sleep for the cycle interval in short slices, waking early on
    /// cancellation.
    fn sleep_interval(&self, token: &CancelToken) {
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_secs(self.config.cycle.interval_secs);
        while std::time::Instant::now() < deadline {
            if token.is_cancelled() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}

impl std::fmt::Debug for HealingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealingEngine")
            .field("decider", &self.decider)
            .field("exclusive_predicates", &self.exclusive.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleVerdict, ScriptedOracle};
    use crate::store::mem::MemStore;

    fn test_config() -> MaatConfig {
        let mut config = MaatConfig::default();
        config.exclusive_predicates = vec!["HAS_CEO".into()];
        config.decision.backoff_base_ms = 0;
        config
    }

    fn fact(subject: &str, object: &str, confidence: f32, timestamp: u64) -> FactInput {
        FactInput {
            subject: subject.into(),
            subject_kind: Some("Organization".into()),
            predicate: "HAS_CEO".into(),
            object: object.into(),
            object_kind: Some("Person".into()),
            metadata: Default::default(),
            source_document: Some(format!("report on {object}")),
            confidence,
            timestamp: Some(timestamp),
        }
    }

    #[test]
    fn full_cycle_heals_ceo_conflict() {
        let store = Arc::new(MemStore::new());
        let engine = HealingEngine::with_oracle(
            store.clone(),
            test_config(),
            MetricsLog::in_memory(),
            None,
        );
        for result in engine.ingest(&[
            fact("TechCorp", "John", 0.95, 1_700_000_000),
            fact("TechCorp", "Jane", 0.90, 1_700_100_000),
        ]) {
            result.unwrap();
        }

        let report = engine.run_full_cycle().unwrap();
        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.healing.healed, 1);
        assert!(store.open_conflicts().unwrap().is_empty());
        assert_eq!(report.metrics.resolved_conflicts, 1);
        assert_eq!(report.metrics.data_accuracy_score, 1.0);
        assert_eq!(engine.metrics_log().len().unwrap(), 1);
    }

    #[test]
    fn scripted_oracle_drives_healing() {
        let store = Arc::new(MemStore::new());
        let oracle = ScriptedOracle::new([Ok(OracleVerdict {
            chosen_index: 0,
            confidence: 0.9,
            reasoning: "newer".into(),
            tokens_used: 200,
        })]);
        let engine = HealingEngine::with_oracle(
            store.clone(),
            test_config(),
            MetricsLog::in_memory(),
            Some(Box::new(oracle)),
        );
        for result in engine.ingest(&[
            fact("TechCorp", "John", 0.95, 1_700_000_000),
            fact("TechCorp", "Jane", 0.90, 1_700_100_000),
        ]) {
            result.unwrap();
        }

        let report = engine.run_full_cycle().unwrap();
        assert_eq!(report.healing.healed, 1);
        assert_eq!(report.healing.tokens_used, 200);
        assert!((report.healing.cost_usd - 200.0 / 1000.0 * 0.03).abs() < 1e-9);
    }

    #[test]
    fn cancelled_loop_runs_one_cycle() {
        let store = Arc::new(MemStore::new());
        let mut config = test_config();
        config.cycle.interval_secs = 1;
        let engine = HealingEngine::with_oracle(store, config, MetricsLog::in_memory(), None);

        let token = CancelToken::new();
        let handle = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(100));
                token.cancel();
            })
        };
        let cycles = engine.run_loop(&token).unwrap();
        handle.join().unwrap();
        assert!(cycles >= 1);
    }

    #[test]
    fn idle_cycle_reports_nothing() {
        let store = Arc::new(MemStore::new());
        let engine =
            HealingEngine::with_oracle(store, test_config(), MetricsLog::in_memory(), None);
        let report = engine.run_full_cycle().unwrap();
        assert_eq!(report.conflicts_detected, 0);
        assert_eq!(report.healing, HealingReport::default());
        assert_eq!(report.metrics.data_accuracy_score, 1.0);
    }
}
