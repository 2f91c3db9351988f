//! Remote segments attached by this process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::client::{ShmClient, ShmSegment};
use crate::error::ShmError;
use crate::types::SegmentKey;

/// At most one mapping per `(protocol, segment)` in a process.
///
/// The lock is never held across [`ShmClient::attach`]. When two threads
/// miss on the same key at once both attach; the first insert wins and the
/// loser's mapping is dropped (unmapped) right away.
#[derive(Debug, Default)]
pub struct SegmentCache {
    segments: RwLock<HashMap<SegmentKey, Arc<dyn ShmSegment>>>,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: SegmentKey) -> Option<Arc<dyn ShmSegment>> {
        self.segments.read().get(&key).cloned()
    }

    /// Return the cached segment for `key`, attaching through `client` on a miss.
    ///
    /// Attach errors are returned unchanged and leave the cache untouched.
    pub fn get_or_attach(
        &self,
        key: SegmentKey,
        client: &dyn ShmClient,
    ) -> Result<Arc<dyn ShmSegment>, ShmError> {
        if let Some(segment) = self.get(key) {
            trace!(%key, "segment cache hit");
            return Ok(segment);
        }

        let attached = client.attach(key.segment())?;
        let mut segments = self.segments.write();
        let segment = segments.entry(key).or_insert_with(|| {
            debug!(%key, "cached new segment");
            attached
        });
        Ok(segment.clone())
    }

    /// Cache a segment obtained some other way (a backend's own mapping).
    ///
    /// If `key` is already cached the existing segment wins and is returned.
    pub fn insert(&self, key: SegmentKey, segment: Arc<dyn ShmSegment>) -> Arc<dyn ShmSegment> {
        let mut segments = self.segments.write();
        segments
            .entry(key)
            .or_insert_with(|| {
                debug!(%key, "cached local segment");
                segment
            })
            .clone()
    }

    /// Drop the cached mapping for `key`.
    ///
    /// Slices already handed out keep the mapping alive until they go away.
    pub fn evict(&self, key: SegmentKey) -> bool {
        let removed = self.segments.write().remove(&key).is_some();
        if removed {
            debug!(%key, "evicted segment");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    pub fn clear(&self) {
        self.segments.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkId, ChunkPtr, SegmentId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeSegment(SegmentId);

    impl ShmSegment for FakeSegment {
        fn map(&self, chunk: ChunkId) -> Result<ChunkPtr, ShmError> {
            Err(ShmError::ChunkOutOfRange {
                segment: self.0,
                chunk,
            })
        }
        fn id(&self) -> SegmentId {
            self.0
        }
    }

    #[derive(Debug, Default)]
    struct CountingClient {
        attaches: AtomicUsize,
    }

    impl ShmClient for CountingClient {
        fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>, ShmError> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if segment == 404 {
                return Err(ShmError::Unavailable {
                    name: "/missing".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(Arc::new(FakeSegment(segment)))
        }
    }

    #[test]
    fn attaches_once_per_key() {
        let cache = SegmentCache::new();
        let client = CountingClient::default();

        let a = cache.get_or_attach(SegmentKey::new(0, 7), &client).unwrap();
        let b = cache.get_or_attach(SegmentKey::new(0, 7), &client).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.attaches.load(Ordering::SeqCst), 1);

        // Same segment id under another protocol is a different segment.
        cache.get_or_attach(SegmentKey::new(1, 7), &client).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_attach_is_not_cached() {
        let cache = SegmentCache::new();
        let client = CountingClient::default();
        assert!(cache.get_or_attach(SegmentKey::new(0, 404), &client).is_err());
        assert!(cache.is_empty());
        assert!(cache.get_or_attach(SegmentKey::new(0, 404), &client).is_err());
        assert_eq!(client.attaches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn insert_keeps_first_segment() {
        let cache = SegmentCache::new();
        let key = SegmentKey::new(3, 9);
        let first: Arc<dyn ShmSegment> = Arc::new(FakeSegment(9));
        let second: Arc<dyn ShmSegment> = Arc::new(FakeSegment(9));

        assert!(Arc::ptr_eq(&cache.insert(key, first.clone()), &first));
        assert!(Arc::ptr_eq(&cache.insert(key, second), &first));
        let client = CountingClient::default();
        assert!(Arc::ptr_eq(&cache.get_or_attach(key, &client).unwrap(), &first));
        assert_eq!(client.attaches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn evict_and_clear() {
        let cache = SegmentCache::new();
        let client = CountingClient::default();
        let key = SegmentKey::new(0, 1);
        let held = cache.get_or_attach(key, &client).unwrap();
        assert!(cache.evict(key));
        assert!(!cache.evict(key));
        assert_eq!(held.id(), 1);

        cache.get_or_attach(key, &client).unwrap();
        assert_eq!(client.attaches.load(Ordering::SeqCst), 2);
        cache.clear();
        assert!(cache.get(key).is_none());
    }
}
