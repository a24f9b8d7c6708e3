//! Rich diagnostic error types for the maat engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives, providing error codes and help text so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the maat engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum MaatError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Decide(#[from] DecideError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("entity not found: {entity_id}")]
    #[diagnostic(
        code(maat::store::entity_not_found),
        help("The entity id does not exist in the store. Upsert the entity first.")
    )]
    EntityNotFound { entity_id: u64 },

    #[error("fact not found: {fact_id}")]
    #[diagnostic(
        code(maat::store::fact_not_found),
        help(
            "The fact id does not exist. Facts are never deleted, so this \
             usually means the id came from a different store instance."
        )
    )]
    FactNotFound { fact_id: u64 },

    #[error("conflict record not found: {conflict_id}")]
    #[diagnostic(
        code(maat::store::conflict_not_found),
        help("No conflict with this id is logged. Run a detection cycle first.")
    )]
    ConflictNotFound { conflict_id: String },

    #[error("transaction rejected: {message}")]
    #[diagnostic(
        code(maat::store::transaction_rejected),
        help(
            "The multi-write transaction was rejected before any write was \
             applied. The store state is unchanged; retrying the same \
             transaction is safe."
        )
    )]
    TransactionRejected { message: String },

    #[error("store unavailable: {message}")]
    #[diagnostic(
        code(maat::store::unavailable),
        help(
            "The fact store could not be reached. The current cycle aborts \
             cleanly and will be retried at the next schedule."
        )
    )]
    Unavailable { message: String },

    #[error("redb error: {message}")]
    #[diagnostic(
        code(maat::store::redb),
        help(
            "The embedded metrics database encountered an error. This may \
             indicate corruption; try a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(maat::store::serde),
        help(
            "Failed to serialize or deserialize stored data. The stored \
             format may have changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(maat::store::io),
        help(
            "A filesystem operation failed. Check that the data directory \
             exists, has correct permissions, and the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Decision errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DecideError {
    #[error("unresolvable — missing evidence: {fact_id} in conflict {conflict_id} has no source document")]
    #[diagnostic(
        code(maat::decide::missing_evidence),
        help(
            "Every contending fact needs a source_document to adjudicate. \
             The conflict is skipped and annotated; other conflicts in the \
             cycle proceed independently."
        )
    )]
    MissingEvidence { conflict_id: String, fact_id: u64 },

    #[error("conflict {conflict_id} has no contending facts")]
    #[diagnostic(
        code(maat::decide::empty_conflict),
        help("A conflict record must reference at least one fact. This indicates a detection bug.")
    )]
    EmptyConflict { conflict_id: String },

    #[error("oracle exhausted after {attempts} attempt(s) for conflict {conflict_id}: {message}")]
    #[diagnostic(
        code(maat::decide::oracle_exhausted),
        help(
            "All oracle attempts failed and heuristic fallback is disabled. \
             The conflict stays open, annotated, and is retried next cycle."
        )
    )]
    OracleExhausted {
        conflict_id: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Result type for decision operations.
pub type DecideResult<T> = std::result::Result<T, DecideError>;

// ---------------------------------------------------------------------------
// Applier errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ApplyError {
    #[error("decision for conflict {decision_conflict} cannot be applied to conflict {conflict_id}")]
    #[diagnostic(
        code(maat::apply::conflict_mismatch),
        help("A CorrectionDecision is bound to exactly one ConflictRecord; pass a matching pair.")
    )]
    ConflictMismatch {
        conflict_id: String,
        decision_conflict: String,
    },

    #[error("chosen fact {chosen} is not in the contending set of conflict {conflict_id}")]
    #[diagnostic(
        code(maat::apply::chosen_not_contending),
        help("The decision's chosen fact must be one of the conflict's contending facts.")
    )]
    ChosenNotContending { conflict_id: String, chosen: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Result type for applier operations.
pub type ApplyResult<T> = std::result::Result<T, ApplyError>;

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    #[diagnostic(
        code(maat::config::read),
        help("Check that the path exists and is readable.")
    )]
    Read { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(maat::config::parse),
        help("The file must be valid TOML matching the MaatConfig schema.")
    )]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(maat::config::invalid), help("{hint}"))]
    Invalid { message: String, hint: String },
}

/// Convenience alias for functions returning maat results.
pub type MaatResult<T> = std::result::Result<T, MaatError>;
