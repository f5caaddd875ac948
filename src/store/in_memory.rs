use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::record::{NewOutboxRecord, OutboxRecord, OutboxStatus, RecordId};

use super::{OutboxStore, OutboxTransaction};

#[derive(Default)]
struct Shared {
    rows: RwLock<BTreeMap<RecordId, OutboxRecord>>,
    next_id: AtomicI64,
    next_tx: AtomicU64,
    /// Record id to the transaction that staged an update to it.
    row_locks: Mutex<HashMap<RecordId, u64>>,
}

/// Thread-safe in-memory outbox store.
///
/// Cloning creates another handle to the same storage. Transactions buffer
/// their writes. An update takes a row lock until the transaction ends, the
/// way `SELECT ... FOR UPDATE NOWAIT` would: a second transaction touching
/// the same record gets [`StoreError::RowLocked`] straight away, so a
/// commit never fails over a record it already updated.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    shared: Arc<Shared>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records ordered by id.
    pub fn records(&self) -> StoreResult<Vec<OutboxRecord>> {
        let rows = self
            .shared
            .rows
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(rows.values().cloned().collect())
    }

    pub fn get(&self, id: RecordId) -> StoreResult<Option<OutboxRecord>> {
        let rows = self
            .shared
            .rows
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(rows.get(&id).cloned())
    }

    fn next_id(&self) -> RecordId {
        RecordId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

struct StagedUpdate {
    record: OutboxRecord,
    base_version: u64,
}

/// Buffered unit of work over an [`InMemoryOutboxStore`].
pub struct InMemoryTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    tx_id: u64,
    inserts: Vec<OutboxRecord>,
    updates: BTreeMap<RecordId, StagedUpdate>,
}

impl InMemoryTransaction<'_> {
    /// Records inserted by this transaction that are not committed yet.
    pub fn staged_inserts(&self) -> usize {
        self.inserts.len()
    }

    fn release_row_locks(&mut self) {
        if self.updates.is_empty() {
            return;
        }
        let mut locks = self
            .store
            .shared
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in self.updates.keys() {
            if locks.get(id) == Some(&self.tx_id) {
                locks.remove(id);
            }
        }
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        self.release_row_locks();
    }
}

fn apply_mutable_fields(target: &mut OutboxRecord, source: &OutboxRecord, version: u64) {
    target.status = source.status;
    target.sent_at = source.sent_at;
    target.retry_count = source.retry_count;
    target.last_error = source.last_error.clone();
    target.version = version;
}

impl OutboxTransaction for InMemoryTransaction<'_> {
    fn insert(&mut self, record: NewOutboxRecord) -> StoreResult<RecordId> {
        let id = self.store.next_id();
        self.inserts.push(OutboxRecord::from_new(id, record));
        Ok(id)
    }

    fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let rows = self
            .store
            .shared
            .rows
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;

        let mut pending: Vec<OutboxRecord> = rows
            .values()
            .map(|row| match self.updates.get(&row.id) {
                Some(staged) => staged.record.clone(),
                None => row.clone(),
            })
            .chain(self.inserts.iter().cloned())
            .filter(OutboxRecord::is_pending)
            .collect();

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn update(&mut self, record: &OutboxRecord, expected_version: u64) -> StoreResult<u64> {
        let next_version = expected_version + 1;

        if let Some(inserted) = self.inserts.iter_mut().find(|r| r.id == record.id) {
            if inserted.version != expected_version {
                return Err(StoreError::VersionConflict {
                    id: record.id,
                    expected: expected_version,
                    actual: inserted.version,
                });
            }
            apply_mutable_fields(inserted, record, next_version);
            return Ok(next_version);
        }

        if let Some(staged) = self.updates.get_mut(&record.id) {
            if staged.record.version != expected_version {
                return Err(StoreError::VersionConflict {
                    id: record.id,
                    expected: expected_version,
                    actual: staged.record.version,
                });
            }
            apply_mutable_fields(&mut staged.record, record, next_version);
            return Ok(next_version);
        }

        let mut locks = self
            .store
            .shared
            .row_locks
            .lock()
            .map_err(|_| StoreError::LockPoisoned("outbox row locks"))?;
        if locks.get(&record.id).is_some_and(|owner| *owner != self.tx_id) {
            return Err(StoreError::RowLocked(record.id));
        }

        let committed = {
            let rows = self
                .store
                .shared
                .rows
                .read()
                .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
            rows.get(&record.id)
                .cloned()
                .ok_or(StoreError::NotFound(record.id))?
        };
        if committed.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: record.id,
                expected: expected_version,
                actual: committed.version,
            });
        }

        locks.insert(record.id, self.tx_id);
        drop(locks);

        let base_version = committed.version;
        let mut staged = committed;
        apply_mutable_fields(&mut staged, record, next_version);
        self.updates.insert(
            record.id,
            StagedUpdate {
                record: staged,
                base_version,
            },
        );
        Ok(next_version)
    }

    fn commit(mut self) -> StoreResult<()> {
        let mut rows = self
            .store
            .shared
            .rows
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox write"))?;

        // Held row locks keep these base versions current.
        for (id, staged) in &self.updates {
            let current = rows.get(id).ok_or(StoreError::NotFound(*id))?;
            if current.version != staged.base_version {
                return Err(StoreError::VersionConflict {
                    id: *id,
                    expected: staged.base_version,
                    actual: current.version,
                });
            }
        }

        for (id, staged) in &self.updates {
            rows.insert(*id, staged.record.clone());
        }
        for record in std::mem::take(&mut self.inserts) {
            rows.insert(record.id, record);
        }
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    type Transaction<'a> = InMemoryTransaction<'a>;

    fn begin(&self) -> StoreResult<InMemoryTransaction<'_>> {
        Ok(InMemoryTransaction {
            store: self,
            tx_id: self.shared.next_tx.fetch_add(1, Ordering::Relaxed),
            inserts: Vec::new(),
            updates: BTreeMap::new(),
        })
    }

    fn delete_older_than(&self, status: OutboxStatus, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let locks = self
            .shared
            .row_locks
            .lock()
            .map_err(|_| StoreError::LockPoisoned("outbox row locks"))?;
        let mut rows = self
            .shared
            .rows
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox write"))?;
        let before = rows.len();
        rows.retain(|id, row| {
            let aged = row.sent_at.unwrap_or(row.created_at) < cutoff;
            locks.contains_key(id) || !(row.status == status && aged)
        });
        Ok(before - rows.len())
    }

    fn find_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let rows = self
            .shared
            .rows
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        let mut found: Vec<_> = rows
            .values()
            .filter(|r| r.aggregate_type == aggregate_type && r.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn count_by_status(&self, status: OutboxStatus) -> StoreResult<usize> {
        let rows = self
            .shared
            .rows
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(rows.values().filter(|r| r.status == status).count())
    }
}
