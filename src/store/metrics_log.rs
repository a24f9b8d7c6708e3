//! Append-only metrics history.
//!
//! Snapshots are keyed by timestamp and never rewritten, which is what
//! makes trend analysis trustworthy. The durable variant is backed by redb
//! (ACID transactions, MVCC reads); the in-memory variant backs tests and
//! one-shot CLI runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{StoreError, StoreResult};
use crate::fact::MetricsSnapshot;

/// Table of snapshot key → bincode-encoded [`MetricsSnapshot`].
const METRICS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("metrics");

/// Append-only [`MetricsSnapshot`] time series.
pub enum MetricsLog {
    Durable(DurableMetricsLog),
    Memory(MemoryMetricsLog),
}

impl MetricsLog {
    /// Open (or create) a durable log in the given data directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        Ok(MetricsLog::Durable(DurableMetricsLog::open(data_dir)?))
    }

    /// Create an in-memory log.
    pub fn in_memory() -> Self {
        MetricsLog::Memory(MemoryMetricsLog::new())
    }

    /// Append a snapshot. History is never rewritten: if the snapshot's
    /// timestamp collides with an existing key, the next free key is used.
    pub fn append(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        match self {
            MetricsLog::Durable(log) => log.append(snapshot),
            MetricsLog::Memory(log) => log.append(snapshot),
        }
    }

    /// Snapshots with keys in `[since, until]`, ascending.
    pub fn range(&self, since: u64, until: u64) -> StoreResult<Vec<MetricsSnapshot>> {
        match self {
            MetricsLog::Durable(log) => log.range(since, until),
            MetricsLog::Memory(log) => log.range(since, until),
        }
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.range(0, u64::MAX)?.len())
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for MetricsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsLog::Durable(_) => f.write_str("MetricsLog::Durable"),
            MetricsLog::Memory(_) => f.write_str("MetricsLog::Memory"),
        }
    }
}

/// redb-backed metrics log.
pub struct DurableMetricsLog {
    db: Arc<Database>,
}

impl DurableMetricsLog {
    /// Open or create the log database under `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("maat-metrics.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    fn append(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        let encoded = bincode::serialize(snapshot).map_err(|e| StoreError::Serialization {
            message: format!("failed to serialize metrics snapshot: {e}"),
        })?;

        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(METRICS_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;

            // Monotonic key: never overwrite an existing snapshot.
            let last = table
                .last()
                .map_err(|e| StoreError::Redb {
                    message: format!("last failed: {e}"),
                })?
                .map(|(k, _)| k.value());
            let key = match last {
                Some(last) if last >= snapshot.timestamp => last + 1,
                _ => snapshot.timestamp,
            };

            table
                .insert(key, encoded.as_slice())
                .map_err(|e| StoreError::Redb {
                    message: format!("insert failed: {e}"),
                })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    fn range(&self, since: u64, until: u64) -> StoreResult<Vec<MetricsSnapshot>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = match txn.open_table(METRICS_TABLE) {
            Ok(table) => table,
            // No writes yet: the table does not exist.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                })
            }
        };

        let mut out = Vec::new();
        let iter = table.range(since..=until).map_err(|e| StoreError::Redb {
            message: format!("range failed: {e}"),
        })?;
        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Redb {
                message: format!("range iteration failed: {e}"),
            })?;
            let snapshot =
                bincode::deserialize(value.value()).map_err(|e| StoreError::Serialization {
                    message: format!("failed to deserialize metrics snapshot: {e}"),
                })?;
            out.push(snapshot);
        }
        Ok(out)
    }
}

/// In-memory metrics log with the same append-only semantics.
pub struct MemoryMetricsLog {
    entries: RwLock<BTreeMap<u64, MetricsSnapshot>>,
}

impl MemoryMetricsLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn append(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        let mut entries = self.entries.write().expect("metrics log lock poisoned");
        let last = entries.keys().next_back().copied();
        let key = match last {
            Some(last) if last >= snapshot.timestamp => last + 1,
            _ => snapshot.timestamp,
        };
        entries.insert(key, snapshot.clone());
        Ok(())
    }

    fn range(&self, since: u64, until: u64) -> StoreResult<Vec<MetricsSnapshot>> {
        let entries = self.entries.read().expect("metrics log lock poisoned");
        Ok(entries.range(since..=until).map(|(_, v)| v.clone()).collect())
    }
}

impl Default for MemoryMetricsLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(ts: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: ts,
            total_entities: 3,
            total_facts: 4,
            conflicted_entities: 1,
            resolved_conflicts: 0,
            unresolved_conflicts: 1,
            unstable_entities: 0,
            total_tokens_used: 500,
            total_healing_cost: 0.015,
            average_confidence: 0.8,
            data_accuracy_score: 1.0 - 1.0 / 3.0,
        }
    }

    #[test]
    fn durable_append_and_range() {
        let dir = TempDir::new().unwrap();
        let log = MetricsLog::open(dir.path()).unwrap();

        log.append(&snapshot(100)).unwrap();
        log.append(&snapshot(200)).unwrap();
        log.append(&snapshot(300)).unwrap();

        let mid = log.range(150, 250).unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].timestamp, 200);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn durable_range_on_fresh_db_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = MetricsLog::open(dir.path()).unwrap();
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn colliding_timestamps_do_not_overwrite() {
        let log = MetricsLog::in_memory();
        log.append(&snapshot(100)).unwrap();
        log.append(&snapshot(100)).unwrap();
        log.append(&snapshot(100)).unwrap();
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn memory_range_is_ascending() {
        let log = MetricsLog::in_memory();
        log.append(&snapshot(300)).unwrap();
        log.append(&snapshot(400)).unwrap();
        let all = log.range(0, u64::MAX).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp < all[1].timestamp);
    }
}
