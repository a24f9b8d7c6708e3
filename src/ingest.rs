//! Ingestion input contract.
//!
//! The extraction pipeline upstream of this crate emits facts as simple
//! JSON records (subject, predicate, object, metadata, source document).
//! This module turns those records into stored entities and facts; the
//! pipeline itself stays external.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::fact::{now_secs, EntityId, FactId, MetaValue};
use crate::store::{FactStore, NewFact};

fn default_confidence() -> f32 {
    1.0
}

/// One fact as emitted by an upstream extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactInput {
    pub subject: String,
    /// Type tag for the subject entity, "Entity" when absent.
    #[serde(default)]
    pub subject_kind: Option<String>,
    pub predicate: String,
    pub object: String,
    #[serde(default)]
    pub object_kind: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
    #[serde(default)]
    pub source_document: Option<String>,
    /// Extraction confidence, 1.0 when the extractor does not report one.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Epoch seconds; ingestion time when absent.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Ids resulting from one ingested fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub subject: EntityId,
    pub object: EntityId,
    pub fact: FactId,
}

const DEFAULT_KIND: &str = "Entity";

/// Ingest one fact: upsert both endpoint entities, then create the edge.
pub fn ingest_fact(store: &dyn FactStore, input: &FactInput) -> StoreResult<Ingested> {
    let subject = store.upsert_entity(
        &input.subject,
        input.subject_kind.as_deref().unwrap_or(DEFAULT_KIND),
    )?;
    let object = store.upsert_entity(
        &input.object,
        input.object_kind.as_deref().unwrap_or(DEFAULT_KIND),
    )?;
    let fact = store.create_fact(NewFact {
        subject,
        predicate: input.predicate.clone(),
        object,
        metadata: input.metadata.clone(),
        source_document: input.source_document.clone(),
        confidence: input.confidence,
        timestamp: input.timestamp.unwrap_or_else(now_secs),
    })?;
    tracing::debug!(%subject, %object, predicate = %input.predicate, "fact ingested");
    Ok(Ingested {
        subject,
        object,
        fact,
    })
}

/// Ingest a batch with per-fact isolation: one bad record does not block
/// the rest. Results come back in input order.
pub fn ingest_batch(
    store: &dyn FactStore,
    inputs: &[FactInput],
) -> Vec<StoreResult<Ingested>> {
    inputs
        .iter()
        .map(|input| {
            let result = ingest_fact(store, input);
            if let Err(err) = &result {
                tracing::warn!(subject = %input.subject, predicate = %input.predicate, %err, "fact rejected");
            }
            result
        })
        .collect()
}
