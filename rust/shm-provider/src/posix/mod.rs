//! Reference protocols over named POSIX shared memory.
//!
//! Two protocols share the same OS plumbing ([`ShmMapping`]) and segment
//! header ([`layout::SegmentHeader`]):
//!
//! - [`POSIX_SLOT_PROTOCOL_ID`]: a fixed array of equal-size slots. The slab
//!   bookkeeping lives inside the segment, so a consumer can inspect it.
//! - [`POSIX_HEAP_PROTOCOL_ID`]: variable-size chunks from an offset-keyed
//!   free list kept in the producing process. Chunk ids are byte offsets in
//!   units of the configured alignment; a length table in the segment bounds
//!   what a consumer maps to the chunk's own block.
//!
//! Each backend owns one segment, created on first `alloc()`. The object name
//! is `/{prefix}-{protocol}-{segment}`, so a client can open a segment from
//! its id alone as long as both sides agree on the prefix. The producer
//! reads its own chunks through the mapping it created.

pub mod heap;
pub mod layout;
pub mod mapping;
pub mod segment_id;
pub mod slot;

pub use heap::{PosixHeapBackend, PosixHeapClient, PosixHeapSegment};
pub use mapping::ShmMapping;
pub use segment_id::SegmentIdGenerator;
pub use slot::{PosixSlotBackend, PosixSlotClient, PosixSlotSegment, SlotStatus};

use crate::types::{ProtocolId, SegmentId};

pub const POSIX_SLOT_PROTOCOL_ID: ProtocolId = 0;
pub const POSIX_HEAP_PROTOCOL_ID: ProtocolId = 1;

/// OS object name of a segment.
pub fn segment_name(prefix: &str, protocol: ProtocolId, segment: SegmentId) -> String {
    format!("/{prefix}-{protocol}-{segment}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_separate_protocols() {
        assert_eq!(segment_name("shmp", 0, 42), "/shmp-0-42");
        assert_ne!(
            segment_name("shmp", POSIX_SLOT_PROTOCOL_ID, 7),
            segment_name("shmp", POSIX_HEAP_PROTOCOL_ID, 7)
        );
    }
}
