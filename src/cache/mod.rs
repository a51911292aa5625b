//! Cached object storage.
//!
//! The on-disk cache storage engine itself is out of scope — `CacheStore`
//! stands in for that external capability, the same way `HttpHeader` stands
//! in for a real wire parser. `MemoryCacheStore` is a reference
//! implementation sufficient to drive `TransactionFsm` end to end in tests,
//! modeled on the `DashMap`-based registries elsewhere in this crate (see
//! `proxy::route::ROUTE_MAP`) rather than any real storage engine idiom.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::header::HttpHeader;

/// Sentinel object size while a writer is still streaming the body in —
/// mirrors the source's `INT64_MAX` "unknown, still being written" marker.
pub const UNKNOWN_SIZE: i64 = i64::MAX;

pub type CacheKey = String;

/// A cached response: frozen request/response headers plus the metadata
/// `CacheFreshnessEvaluator` needs to judge later hits. Immutable once
/// stored — revalidation produces a new `CachedObject`, it never mutates
/// one in place.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub request: HttpHeader,
    pub response: HttpHeader,
    pub request_sent_time: DateTime<Utc>,
    pub response_received_time: DateTime<Utc>,
    pub object_size: i64,
    pub stored_at: DateTime<Utc>,
    /// The response body, held in process memory. Stands in for the
    /// storage-engine-backed body a real deployment would stream from disk;
    /// sufficient for `MemoryCacheStore` to serve a genuine hit end to end.
    pub body: Bytes,
}

impl CachedObject {
    pub fn is_being_written(&self) -> bool {
        self.object_size == UNKNOWN_SIZE
    }

    pub fn resident_time(&self, now: DateTime<Utc>) -> std::time::Duration {
        now.signed_duration_since(self.stored_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Read/write access to stored objects, keyed by the caller's cache key
/// (normally the effective request URL, widened by `Vary` before lookup).
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<CachedObject>>;
    fn put(&self, key: &str, object: CachedObject);
    fn remove(&self, key: &str);
}

/// In-memory reference `CacheStore`. No eviction policy: a real deployment
/// would back this with a dedicated storage engine instead.
#[derive(Default)]
pub struct MemoryCacheStore {
    objects: DashMap<CacheKey, Arc<CachedObject>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<Arc<CachedObject>> {
        self.objects.get(key).map(|e| e.value().clone())
    }

    fn put(&self, key: &str, object: CachedObject) {
        self.objects.insert(key.to_string(), Arc::new(object));
    }

    fn remove(&self, key: &str) {
        self.objects.remove(key);
    }
}

/// Tracks which cache keys currently have an in-flight write, so concurrent
/// requests for the same miss can be told to wait rather than stampede the
/// origin. Separate from `CacheStore` because the lock itself has no
/// storage-engine dependency — it is pure in-process coordination.
#[derive(Default)]
pub struct WriteLockTable {
    inflight: DashMap<CacheKey, ()>,
}

impl WriteLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to become the writer for `key`. Returns `true` if this
    /// caller now holds the lock, `false` if another writer already does.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.inflight.insert(key.to_string(), ()).is_none()
    }

    pub fn release(&self, key: &str) {
        self.inflight.remove(key);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HttpHeader, Method, Scheme, Url};

    fn object(size: i64) -> CachedObject {
        let now = Utc::now();
        CachedObject {
            request: HttpHeader::new_request(
                Method::parse("GET"),
                Url::new(Scheme::Http, "example.com", "/"),
                (1, 1),
            ),
            response: HttpHeader::new_response(200, "OK", (1, 1)),
            request_sent_time: now,
            response_received_time: now,
            object_size: size,
            stored_at: now,
            body: Bytes::new(),
        }
    }

    #[test]
    fn store_roundtrips() {
        let store = MemoryCacheStore::new();
        assert!(store.get("/a").is_none());
        store.put("/a", object(42));
        let got = store.get("/a").unwrap();
        assert_eq!(got.object_size, 42);
        assert!(!got.is_being_written());
        store.remove("/a");
        assert!(store.get("/a").is_none());
    }

    #[test]
    fn being_written_sentinel() {
        assert!(object(UNKNOWN_SIZE).is_being_written());
    }

    #[test]
    fn write_lock_table_serializes_one_writer() {
        let table = WriteLockTable::new();
        assert!(table.try_acquire("/a"));
        assert!(!table.try_acquire("/a"));
        assert!(table.is_locked("/a"));
        table.release("/a");
        assert!(!table.is_locked("/a"));
        assert!(table.try_acquire("/a"));
    }
}
