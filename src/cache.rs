use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::rr::Record;
use rustc_hash::FxHashMap;

use crate::entry::RecordKey;

/// One resolved record plus its absolute expiry, stamped at store time.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    record: Record,
    expires_at: Instant,
}

impl CachedRecord {
    fn new(record: Record, now: Instant) -> Self {
        let ttl = Duration::from_secs(u64::from(record.ttl()));
        Self {
            record,
            expires_at: now + ttl,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// Bounded RRset cache with insertion-order eviction.
///
/// The key map and the eviction queue always hold exactly the same key set;
/// both live behind a single lock so concurrent stores can never split them.
pub struct ResolveCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: FxHashMap<RecordKey, Vec<CachedRecord>>,
    order: VecDeque<RecordKey>,
}

impl ResolveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whole RRset or nothing: a single expired member invalidates the set
    /// and forces a fresh upstream resolution.
    pub fn lookup(&self, key: &RecordKey) -> Option<Vec<Record>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let set = inner.entries.get(key)?;
        if set.iter().any(CachedRecord::expired) {
            return None;
        }
        Some(set.iter().map(|cached| cached.record().clone()).collect())
    }

    /// Replace the RRset for `key`, evicting the oldest entry when full.
    pub fn store(&self, key: &RecordKey, records: &[Record]) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.entries.remove(key).is_some() {
            inner.order.retain(|queued| queued != key);
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key.clone(),
            records
                .iter()
                .map(|record| CachedRecord::new(record.clone(), now))
                .collect(),
        );
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(inner.entries.len(), inner.order.len());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
