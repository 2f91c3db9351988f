//! Per-session shared-memory state: the registry and the segment cache.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::SegmentCache;
use crate::client::{ShmClient, ShmSegment};
use crate::descriptor::ShmDescriptor;
use crate::error::ShmError;
use crate::provider::{ShmProvider, ShmSlice};
use crate::registry::ShmRegistry;
use crate::types::{ChunkDescriptor, ChunkPtr, ProtocolId, SegmentId, SegmentKey};

/// Everything a session needs to allocate and to resolve received payloads.
///
/// Explicitly constructed and passed around; there is no process-global
/// instance. `Send + Sync`, so it can be shared behind an [`Arc`].
#[derive(Debug)]
pub struct ShmContext {
    registry: ShmRegistry,
    cache: SegmentCache,
}

impl ShmContext {
    pub fn new(registry: ShmRegistry) -> Self {
        Self {
            registry,
            cache: SegmentCache::new(),
        }
    }

    pub fn registry(&self) -> &ShmRegistry {
        &self.registry
    }

    /// Allocation handle for `protocol`; `None` if this process has no
    /// backend for it.
    pub fn provider_for(&self, protocol: ProtocolId) -> Option<ShmProvider<'_>> {
        let backend = self.registry.provider_for(protocol)?;
        Some(ShmProvider::new(self, backend))
    }

    pub fn client_for(&self, protocol: ProtocolId) -> Option<&Arc<dyn ShmClient>> {
        self.registry.client_for(protocol)
    }

    /// The mapped segment for `(protocol, segment)`, attaching on first use.
    ///
    /// A segment owned by this process's backend resolves to the backend's own
    /// mapping, so producer-only contexts can read their chunks. Anything else
    /// goes through the protocol's client; a cache miss there blocks on OS
    /// calls.
    pub fn segment(
        &self,
        protocol: ProtocolId,
        segment: SegmentId,
    ) -> Result<Arc<dyn ShmSegment>, ShmError> {
        let key = SegmentKey::new(protocol, segment);
        if let Some(segment) = self.cache.get(key) {
            return Ok(segment);
        }
        let local = self
            .registry
            .provider_for(protocol)
            .and_then(|backend| backend.lock().local_segment(segment));
        if let Some(local) = local {
            return Ok(self.cache.insert(key, local));
        }
        let client = self
            .registry
            .client_for(protocol)
            .ok_or(ShmError::NoClient(protocol))?;
        self.cache.get_or_attach(key, client.as_ref())
    }

    pub(crate) fn resolve(
        &self,
        protocol: ProtocolId,
        chunk: &ChunkDescriptor,
    ) -> Result<(Arc<dyn ShmSegment>, ChunkPtr), ShmError> {
        let segment = self.segment(protocol, chunk.segment)?;
        let ptr = segment.map(chunk.chunk)?;
        Ok((segment, ptr))
    }

    /// Resolve a whole chunk.
    pub fn map_chunk(
        &self,
        protocol: ProtocolId,
        chunk: &ChunkDescriptor,
    ) -> Result<ShmSlice, ShmError> {
        let (segment, ptr) = self.resolve(protocol, chunk)?;
        Ok(ShmSlice::new(segment, ptr.data, ptr.len))
    }

    /// Resolve a received payload to its bytes.
    ///
    /// Attach and map errors propagate unchanged. A length past the end of the
    /// chunk is rejected.
    pub fn map(&self, descriptor: &ShmDescriptor) -> Result<ShmSlice, ShmError> {
        let (segment, ptr) = self.resolve(descriptor.protocol, &descriptor.chunk)?;
        let len = descriptor.len as usize;
        if len > ptr.len {
            return Err(ShmError::LengthOutOfRange {
                len,
                capacity: ptr.len,
            });
        }
        trace!(
            protocol = descriptor.protocol,
            chunk = %descriptor.chunk,
            len,
            "mapped payload"
        );
        Ok(ShmSlice::new(segment, ptr.data, len))
    }

    /// [`map`](Self::map) for async dispatch: a cache miss attaches on the
    /// blocking pool instead of the calling task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn map_async(self: &Arc<Self>, descriptor: ShmDescriptor) -> Result<ShmSlice, ShmError> {
        if self.cache.get(descriptor.segment_key()).is_some() {
            return self.map(&descriptor);
        }
        let context = Arc::clone(self);
        tokio::task::spawn_blocking(move || context.map(&descriptor))
            .await
            .map_err(|e| ShmError::Join(e.to_string()))?
    }

    /// Forget the mapping of one remote segment. Live slices keep it mapped.
    pub fn evict(&self, protocol: ProtocolId, segment: SegmentId) -> bool {
        self.cache.evict(SegmentKey::new(protocol, segment))
    }

    /// Number of segments currently cached.
    pub fn segment_count(&self) -> usize {
        self.cache.len()
    }

    /// Unmap every cached segment, then tear down every backend.
    pub fn teardown(self) -> Result<(), ShmError> {
        debug!(segments = self.cache.len(), "tearing down shm context");
        self.cache.clear();
        self.registry.teardown()
    }
}
