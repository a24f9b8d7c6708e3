//! # maat
//!
//! A self-correcting temporal fact graph. Facts are extracted claims with
//! provenance and validity in time; the engine continuously detects
//! conflicting claims, adjudicates them with a local reasoning oracle (or
//! a deterministic heuristic), and commits corrections atomically.
//!
//! ## Architecture
//!
//! - **Fact store** (`store`): dashmap-indexed entity/fact tables with a
//!   petgraph adjacency index and a transactional write-op commit
//! - **Detection** (`detect`): pure snapshot-based strategies for
//!   duplicates, temporal overlaps, low confidence, and staleness
//! - **Decision** (`decide`): oracle adjudication with bounded retry plus
//!   a deterministic fallback heuristic
//! - **Applier** (`apply`): idempotent all-or-nothing correction commits
//! - **Observability** (`observe`): accuracy scoring, instability flags,
//!   high-risk reporting, append-only metrics history
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use maat::config::MaatConfig;
//! use maat::engine::HealingEngine;
//! use maat::store::mem::MemStore;
//! use maat::store::metrics_log::MetricsLog;
//!
//! let mut config = MaatConfig::default();
//! config.exclusive_predicates.push("HAS_CEO".into());
//! let engine = HealingEngine::new(Arc::new(MemStore::new()), config, MetricsLog::in_memory());
//! let report = engine.run_full_cycle().unwrap();
//! println!("healed {} conflicts", report.healing.healed);
//! ```

pub mod apply;
pub mod config;
pub mod decide;
pub mod detect;
pub mod engine;
pub mod error;
pub mod fact;
pub mod ingest;
pub mod observe;
pub mod oracle;
pub mod store;
