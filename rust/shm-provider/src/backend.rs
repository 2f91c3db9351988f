//! Producer-side allocator contract.

use std::sync::Arc;

use crate::client::ShmSegment;
use crate::error::{AllocError, FreeError, ShmError};
use crate::types::{AllocatedChunk, ChunkDescriptor, SegmentId};

/// A pluggable allocator for one shared-memory protocol.
///
/// Implement this to make a new kind of memory (POSIX shm, a camera driver's
/// buffer pool, ...) usable by a [`ShmContext`](crate::ShmContext). The
/// registry wraps each backend in a mutex, so implementations only need
/// `Send`; they are never called concurrently.
pub trait ShmProviderBackend: Send {
    /// Allocate a chunk of at least `len` bytes.
    ///
    /// - `len == 0` or `len > max_chunk_size()` fail with a constraint error.
    /// - [`AllocError::OutOfMemory`]: no free capacity.
    /// - [`AllocError::NeedDefragment`]: capacity exists but not in a usable
    ///   shape. The caller calls [`defragment`](Self::defragment) and retries
    ///   once; the backend never retries on its own.
    ///
    /// Every chunk returned is disjoint from every other chunk not yet freed.
    fn alloc(&mut self, len: usize) -> Result<AllocatedChunk, AllocError>;

    /// Return a chunk.
    ///
    /// Freeing a chunk from another segment, or one that is not allocated, is
    /// a protocol violation: it must be reported and must not alter state.
    ///
    /// A [`ChunkDescriptor`] carries no allocation generation. A stale
    /// descriptor whose chunk id was handed out again frees the new occupant;
    /// [`ShmProvider::free`](crate::ShmProvider::free) takes the buffer by
    /// value so safe callers cannot get there.
    fn free(&mut self, chunk: &ChunkDescriptor) -> Result<(), FreeError>;

    /// Best-effort compaction. Never moves memory behind an unfreed chunk.
    ///
    /// Returns the size of the largest chunk that can be allocated afterwards.
    fn defragment(&mut self) -> usize;

    /// Free bytes, contiguous or not.
    fn available(&self) -> usize;

    /// Largest `len` that `alloc` can ever satisfy.
    fn max_chunk_size(&self) -> usize;

    /// Whether `chunk` addresses memory this backend hands out.
    ///
    /// Used to accept chunks produced outside `alloc()` (push sources such as
    /// hardware drivers).
    fn recognizes(&self, chunk: &ChunkDescriptor) -> bool;

    /// This backend's own mapping of `segment`, if it owns that segment.
    ///
    /// Lets a producer resolve its own chunks without a registered client.
    /// Backends whose memory is only reachable through a client keep the
    /// default.
    fn local_segment(&self, segment: SegmentId) -> Option<Arc<dyn ShmSegment>> {
        let _ = segment;
        None
    }

    /// Release every OS resource (unmap and unlink segments).
    ///
    /// Only call once every chunk derived from this backend has expired; the
    /// backend does not track outstanding chunks. After teardown `alloc` fails
    /// with [`AllocError::TornDown`] and further teardowns are no-ops.
    fn teardown(&mut self) -> Result<(), ShmError>;
}
