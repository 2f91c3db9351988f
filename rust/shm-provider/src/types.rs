//! Identifiers and chunk value types.

use std::fmt;
use std::ptr::NonNull;

/// Identifies one shared-memory technology.
///
/// Backends and clients that disagree on segment layout must never share a
/// protocol id.
pub type ProtocolId = u32;

/// Identifies one segment within a protocol.
pub type SegmentId = u32;

/// Identifies a chunk within its segment. The addressing scheme (slot index,
/// scaled byte offset, ...) belongs to the protocol.
pub type ChunkId = u32;

/// Uniquely identifies a chunk within a segment.
///
/// This is the only per-chunk state that crosses the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDescriptor {
    pub segment: SegmentId,
    pub chunk: ChunkId,
}

impl ChunkDescriptor {
    #[inline]
    pub const fn new(segment: SegmentId, chunk: ChunkId) -> Self {
        Self { segment, chunk }
    }
}

impl fmt::Display for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.chunk)
    }
}

/// A chunk handed out by a backend: its descriptor plus where it lives in the
/// allocating process.
///
/// The pointer is meaningless in any other address space; only
/// [`AllocatedChunk::descriptor`] is ever transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedChunk {
    pub descriptor: ChunkDescriptor,
    pub data: NonNull<u8>,
    /// Usable bytes at `data` (>= the requested length).
    pub len: usize,
}

// SAFETY: the pointer refers to a shared mapping, not thread-local memory.
unsafe impl Send for AllocatedChunk {}
unsafe impl Sync for AllocatedChunk {}

/// The result of resolving a chunk id inside a mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPtr {
    pub data: NonNull<u8>,
    /// Bytes addressable from `data` without leaving the chunk's bounds as the
    /// segment knows them.
    pub len: usize,
}

unsafe impl Send for ChunkPtr {}
unsafe impl Sync for ChunkPtr {}

/// Combined `(protocol, segment)` key: one lookup resolves a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey(u64);

impl SegmentKey {
    #[inline]
    pub const fn new(protocol: ProtocolId, segment: SegmentId) -> Self {
        Self(((protocol as u64) << 32) | segment as u64)
    }

    #[inline]
    pub const fn protocol(self) -> ProtocolId {
        (self.0 >> 32) as ProtocolId
    }

    #[inline]
    pub const fn segment(self) -> SegmentId {
        self.0 as SegmentId
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol(), self.segment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_key_packs_both_halves() {
        let key = SegmentKey::new(7, u32::MAX);
        assert_eq!(key.protocol(), 7);
        assert_eq!(key.segment(), u32::MAX);
        assert_eq!(key.as_u64(), (7u64 << 32) | u32::MAX as u64);
        assert_ne!(SegmentKey::new(1, 2), SegmentKey::new(2, 1));
    }
}
