//! Consumer-side attachment contract.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::ShmError;
use crate::types::{ChunkId, ChunkPtr, SegmentId};

/// Attaches to segments of one protocol given only their id.
///
/// Clients are near-stateless factories: they do not cache or retry. The
/// [`ShmContext`](crate::ShmContext) deduplicates attaches per segment.
pub trait ShmClient: Debug + Send + Sync {
    /// Open and map the segment named by `segment`.
    ///
    /// May block on OS calls. Fails with a
    /// [`ResourceUnavailable`](crate::ErrorKind::ResourceUnavailable) error if
    /// the segment does not exist or cannot be mapped.
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>, ShmError>;
}

/// One mapped segment in the consuming process.
///
/// Dropping the last reference unmaps it. A segment never deletes the named
/// resource behind it; that belongs to the producing backend.
pub trait ShmSegment: Debug + Send + Sync {
    /// Resolve a chunk id to a pointer in this process.
    ///
    /// Out-of-range ids are an error; implementations must bounds-check before
    /// doing any pointer arithmetic.
    fn map(&self, chunk: ChunkId) -> Result<ChunkPtr, ShmError>;

    fn id(&self) -> SegmentId;
}
