//! Local record store interface and an in-memory implementation.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use slumber_codec::Timestamp;
use slumber_sync_protocol::{EntityId, EntityKind, SyncRecord};
use std::collections::BTreeMap;
use std::future::{ready, Future};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Selects records from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreQuery {
    /// The record with this identity.
    ById(EntityId),
    /// Records whose `lastUpdated` is strictly after the instant.
    ChangedSince(Timestamp),
    /// Records of one kind.
    Kind(EntityKind),
    /// Every record.
    All,
}

impl StoreQuery {
    /// Returns true if the record is selected.
    pub fn matches(&self, record: &SyncRecord) -> bool {
        match self {
            StoreQuery::ById(id) => record.id() == *id,
            StoreQuery::ChangedSince(since) => record.last_updated() > *since,
            StoreQuery::Kind(kind) => record.kind() == *kind,
            StoreQuery::All => true,
        }
    }
}

/// A device's local record store.
///
/// The coordinator is the only writer during a session. Implementations
/// must make `upsert_batch` all-or-nothing.
pub trait EntityStore: Send + Sync + 'static {
    /// Fetches matching records ordered by `lastUpdated`, then identity.
    fn fetch(&self, query: StoreQuery) -> impl Future<Output = SyncResult<Vec<SyncRecord>>> + Send;

    /// Inserts or replaces one record.
    fn upsert(&self, record: SyncRecord) -> impl Future<Output = SyncResult<()>> + Send;

    /// Inserts or replaces several records atomically.
    fn upsert_batch(&self, records: Vec<SyncRecord>)
        -> impl Future<Output = SyncResult<()>> + Send;

    /// Removes a record. Returns whether it existed.
    fn delete(&self, id: EntityId) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Start time of the last successfully applied session.
    fn current_watermark(&self) -> impl Future<Output = SyncResult<Timestamp>> + Send;

    /// Moves the watermark forward. Never moves it back; returns the new value.
    fn advance_watermark(&self, to: Timestamp)
        -> impl Future<Output = SyncResult<Timestamp>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<EntityId, SyncRecord>,
    watermark: Timestamp,
}

/// In-memory [`EntityStore`] for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, or succeed again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of records written since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Looks up one record without going through the async interface.
    pub fn get(&self, id: &EntityId) -> Option<SyncRecord> {
        self.state.read().records.get(id).cloned()
    }

    /// Every record, ordered by identity.
    pub fn snapshot(&self) -> Vec<SyncRecord> {
        self.state.read().records.values().cloned().collect()
    }

    /// Current watermark without going through the async interface.
    pub fn watermark(&self) -> Timestamp {
        self.state.read().watermark
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::store_write("memory store is failing writes"))
        } else {
            Ok(())
        }
    }

    fn fetch_now(&self, query: StoreQuery) -> Vec<SyncRecord> {
        let state = self.state.read();
        let mut matched: Vec<SyncRecord> = match query {
            StoreQuery::ById(id) => state.records.get(&id).cloned().into_iter().collect(),
            _ => state
                .records
                .values()
                .filter(|record| query.matches(record))
                .cloned()
                .collect(),
        };
        matched.sort_by_key(|record| (record.last_updated(), record.id()));
        matched
    }

    fn upsert_now(&self, records: Vec<SyncRecord>) -> SyncResult<()> {
        self.check_writable()?;
        let count = records.len() as u64;
        let mut state = self.state.write();
        for record in records {
            state.records.insert(record.id(), record);
        }
        self.writes.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    fn delete_now(&self, id: EntityId) -> SyncResult<bool> {
        self.check_writable()?;
        Ok(self.state.write().records.remove(&id).is_some())
    }

    fn advance_now(&self, to: Timestamp) -> SyncResult<Timestamp> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.watermark = state.watermark.max(to);
        Ok(state.watermark)
    }
}

impl EntityStore for MemoryStore {
    fn fetch(&self, query: StoreQuery) -> impl Future<Output = SyncResult<Vec<SyncRecord>>> + Send {
        ready(Ok(self.fetch_now(query)))
    }

    fn upsert(&self, record: SyncRecord) -> impl Future<Output = SyncResult<()>> + Send {
        ready(self.upsert_now(vec![record]))
    }

    fn upsert_batch(
        &self,
        records: Vec<SyncRecord>,
    ) -> impl Future<Output = SyncResult<()>> + Send {
        ready(self.upsert_now(records))
    }

    fn delete(&self, id: EntityId) -> impl Future<Output = SyncResult<bool>> + Send {
        ready(self.delete_now(id))
    }

    fn current_watermark(&self) -> impl Future<Output = SyncResult<Timestamp>> + Send {
        ready(Ok(self.watermark()))
    }

    fn advance_watermark(
        &self,
        to: Timestamp,
    ) -> impl Future<Output = SyncResult<Timestamp>> + Send {
        ready(self.advance_now(to))
    }
}
