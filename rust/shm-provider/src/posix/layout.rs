//! Self-describing header at offset 0 of every POSIX segment.
//!
//! ```text
//! 0                    64
//! ┌────────────────────┬──────────────────────────────────────────┐
//! │ SegmentHeader      │ protocol-specific area                   │
//! └────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The creating backend fills the header and publishes it by storing
//! `version` last (release). An attaching client checks magic, version,
//! protocol and that every offset it will use lies inside the mapping.

use std::sync::atomic::{AtomicU32, Ordering};

use static_assertions::{assert_eq_size, const_assert_eq};

use crate::error::ShmError;
use crate::types::ProtocolId;

pub const SEGMENT_MAGIC: [u8; 8] = *b"SHMPROV\0";
pub const SEGMENT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    /// Zero until the creator finished initializing the segment.
    pub version: AtomicU32,
    pub protocol: ProtocolId,
    /// Start of the chunk data area.
    pub data_offset: u64,
    /// Bytes in the chunk data area.
    pub data_len: u64,
    /// Slot size (slot protocol) or chunk alignment (heap protocol).
    pub chunk_unit: u32,
    /// Number of addressable chunk ids.
    pub chunk_count: u32,
    _pad: [u8; 24],
}

assert_eq_size!(SegmentHeader, [u8; HEADER_SIZE]);
const_assert_eq!(std::mem::align_of::<SegmentHeader>(), 64);

/// Plain copy of a validated header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    pub protocol: ProtocolId,
    pub data_offset: usize,
    pub data_len: usize,
    pub chunk_unit: u32,
    pub chunk_count: u32,
}

impl SegmentGeometry {
    /// Bytes the whole segment needs.
    pub fn total_len(&self) -> Option<usize> {
        self.data_offset.checked_add(self.data_len)
    }
}

impl SegmentHeader {
    /// Write the header into freshly created memory and publish it.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `HEADER_SIZE` writable, 64-byte aligned
    /// bytes that no other process reads yet.
    pub unsafe fn write(base: *mut u8, geometry: &SegmentGeometry) {
        let header = base as *mut SegmentHeader;
        // SAFETY: caller guarantees `base` is valid and aligned.
        unsafe {
            std::ptr::write(
                header,
                SegmentHeader {
                    magic: SEGMENT_MAGIC,
                    version: AtomicU32::new(0),
                    protocol: geometry.protocol,
                    data_offset: geometry.data_offset as u64,
                    data_len: geometry.data_len as u64,
                    chunk_unit: geometry.chunk_unit,
                    chunk_count: geometry.chunk_count,
                    _pad: [0; 24],
                },
            );
            (*header).version.store(SEGMENT_VERSION, Ordering::Release);
        }
    }

    /// Validate the header of a mapping of `mapped_len` bytes.
    pub fn read(
        &self,
        name: &str,
        expected: ProtocolId,
        mapped_len: usize,
    ) -> Result<SegmentGeometry, ShmError> {
        let layout_err = |reason: String| ShmError::Layout {
            name: name.to_string(),
            reason,
        };

        if self.magic != SEGMENT_MAGIC {
            return Err(layout_err(format!("bad magic {:?}", self.magic)));
        }
        let version = self.version.load(Ordering::Acquire);
        if version != SEGMENT_VERSION {
            return Err(layout_err(format!(
                "unsupported version {version} (expected {SEGMENT_VERSION})"
            )));
        }
        if self.protocol != expected {
            return Err(layout_err(format!(
                "segment belongs to protocol {}, not {expected}",
                self.protocol
            )));
        }

        let geometry = SegmentGeometry {
            protocol: self.protocol,
            data_offset: usize::try_from(self.data_offset)
                .map_err(|_| layout_err("data offset overflows usize".into()))?,
            data_len: usize::try_from(self.data_len)
                .map_err(|_| layout_err("data length overflows usize".into()))?,
            chunk_unit: self.chunk_unit,
            chunk_count: self.chunk_count,
        };
        if geometry.data_offset < HEADER_SIZE {
            return Err(layout_err(format!(
                "data offset {} overlaps the header",
                geometry.data_offset
            )));
        }
        match geometry.total_len() {
            Some(total) if total <= mapped_len => Ok(geometry),
            _ => Err(layout_err(format!(
                "data area {}+{} exceeds mapping of {mapped_len} bytes",
                geometry.data_offset, geometry.data_len
            ))),
        }
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_primitives::HeapRegion;

    fn geometry() -> SegmentGeometry {
        SegmentGeometry {
            protocol: 1,
            data_offset: 64,
            data_len: 256,
            chunk_unit: 64,
            chunk_count: 4,
        }
    }

    #[test]
    fn header_round_trips() {
        let heap = HeapRegion::new_zeroed(HEADER_SIZE + 256);
        let base = heap.region().as_ptr();
        unsafe { SegmentHeader::write(base, &geometry()) };
        let header = unsafe { &*(base as *const SegmentHeader) };
        assert_eq!(header.read("/t", 1, 320).unwrap(), geometry());
    }

    #[test]
    fn header_rejects_mismatches() {
        let heap = HeapRegion::new_zeroed(HEADER_SIZE + 256);
        let base = heap.region().as_ptr();

        // Zeroed memory: never initialized.
        let blank = unsafe { &*(base as *const SegmentHeader) };
        assert!(matches!(blank.read("/t", 1, 320), Err(ShmError::Layout { .. })));

        unsafe { SegmentHeader::write(base, &geometry()) };
        let header = unsafe { &*(base as *const SegmentHeader) };
        assert!(header.read("/t", 0, 320).is_err());
        assert!(header.read("/t", 1, 319).is_err());
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 64), Some(64));
        assert_eq!(align_up(128, 64), Some(128));
        assert_eq!(align_up(usize::MAX, 64), None);
    }
}
