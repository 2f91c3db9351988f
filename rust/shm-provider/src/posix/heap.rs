//! Variable-size protocol.
//!
//! ```text
//! 0        64                            data_offset (aligned)
//! ┌────────┬────────────────────────────┬──────────────────────────────────┐
//! │ header │ chunk lengths (u32 × count) │ chunks at multiples of alignment │
//! └────────┴────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Bookkeeping is an [`OffsetFreeList`] private to the producer. The chunk id
//! is the chunk's byte offset divided by the alignment, so a consumer can
//! resolve it from the header alone. The length table holds each live
//! chunk's block length in alignment units (zero when free), which bounds
//! what a consumer can map.

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use shm_primitives::{FreeListError, OffsetFreeList};
use tracing::{debug, trace, warn};

use super::layout::{HEADER_SIZE, SegmentGeometry, SegmentHeader, align_up};
use super::mapping::ShmMapping;
use super::segment_id::{MAX_ID_ATTEMPTS, SegmentIdGenerator};
use super::{POSIX_HEAP_PROTOCOL_ID, segment_name};
use crate::backend::ShmProviderBackend;
use crate::client::{ShmClient, ShmSegment};
use crate::config::HeapBackendConfig;
use crate::error::{AllocError, FreeError, ShmError};
use crate::types::{AllocatedChunk, ChunkDescriptor, ChunkId, ChunkPtr, SegmentId};

/// The length table starts right after the header.
const LENGTHS_OFFSET: usize = HEADER_SIZE;

/// End of a length table for `chunk_count` chunks.
fn lengths_end(chunk_count: u32) -> Option<usize> {
    (chunk_count as usize)
        .checked_mul(size_of::<u32>())?
        .checked_add(LENGTHS_OFFSET)
}

/// Producer side of the heap protocol.
///
/// Shares its mapping with local readers as a [`PosixHeapSegment`].
pub struct PosixHeapBackend {
    config: HeapBackendConfig,
    geometry: SegmentGeometry,
    free_list: OffsetFreeList,
    ids: SegmentIdGenerator,
    segment: Option<Arc<PosixHeapSegment>>,
    torn_down: bool,
}

impl PosixHeapBackend {
    /// Validate `config`. No OS resource is created until the first `alloc`.
    pub fn new(config: HeapBackendConfig) -> Result<Self, ShmError> {
        config.validate()?;
        let overflow = || {
            ShmError::InvalidConfig(format!("segment of {} bytes overflows", config.size))
        };
        let free_list = OffsetFreeList::new(config.size, config.alignment);
        let chunk_unit = u32::try_from(config.alignment).map_err(|_| overflow())?;
        let chunk_count =
            u32::try_from(free_list.capacity() / config.alignment).map_err(|_| overflow())?;
        let data_offset = lengths_end(chunk_count)
            .and_then(|end| align_up(end, config.alignment))
            .ok_or_else(overflow)?;
        let geometry = SegmentGeometry {
            protocol: POSIX_HEAP_PROTOCOL_ID,
            data_offset,
            data_len: free_list.capacity(),
            chunk_unit,
            chunk_count,
        };
        if geometry.total_len().is_none() {
            return Err(overflow());
        }
        Ok(Self {
            config,
            geometry,
            free_list,
            ids: SegmentIdGenerator::new(),
            segment: None,
            torn_down: false,
        })
    }

    pub fn segment_id(&self) -> Option<SegmentId> {
        self.segment.as_ref().map(|s| s.id)
    }

    pub fn config(&self) -> &HeapBackendConfig {
        &self.config
    }

    /// Number of chunks currently allocated.
    pub fn live_chunks(&self) -> usize {
        self.free_list.live_count()
    }

    fn ensure_segment(&mut self) -> Result<Arc<PosixHeapSegment>, AllocError> {
        if self.torn_down {
            return Err(AllocError::TornDown);
        }
        if let Some(segment) = &self.segment {
            return Ok(Arc::clone(segment));
        }
        let segment = Arc::new(self.create_segment()?);
        self.segment = Some(Arc::clone(&segment));
        Ok(segment)
    }

    fn create_segment(&self) -> Result<PosixHeapSegment, AllocError> {
        let len = self
            .geometry
            .total_len()
            .ok_or_else(|| AllocError::SegmentUnavailable("segment size overflows".into()))?;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id();
            let name = segment_name(&self.config.name_prefix, POSIX_HEAP_PROTOCOL_ID, id);
            let mapping = match ShmMapping::create(&name, len) {
                Ok(mapping) => mapping,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(%name, "segment id in use, retrying");
                    continue;
                }
                Err(e) => return Err(AllocError::SegmentUnavailable(format!("{name}: {e}"))),
            };
            // SAFETY: freshly created with O_EXCL, so still private to us. The
            // length table is zero (all free) from ftruncate.
            unsafe { SegmentHeader::write(mapping.region().as_ptr(), &self.geometry) };
            debug!(
                %name,
                segment = id,
                capacity = self.geometry.data_len,
                alignment = self.config.alignment,
                "created heap segment"
            );
            return Ok(PosixHeapSegment {
                id,
                geometry: self.geometry,
                mapping,
            });
        }
        Err(AllocError::SegmentUnavailable(format!(
            "no unused segment id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    fn chunk_offset(&self, chunk: ChunkId) -> Option<usize> {
        (chunk < self.geometry.chunk_count).then(|| chunk as usize * self.config.alignment)
    }

    fn check_free(&mut self, chunk: &ChunkDescriptor) -> Result<(), FreeError> {
        if self.torn_down {
            return Err(FreeError::TornDown);
        }
        let segment = match &self.segment {
            Some(segment) if segment.id == chunk.segment => Arc::clone(segment),
            other => {
                return Err(FreeError::ForeignSegment {
                    descriptor: *chunk,
                    owned: other.as_ref().map(|s| s.id),
                });
            }
        };
        let offset = self
            .chunk_offset(chunk.chunk)
            .ok_or(FreeError::InvalidChunk(*chunk))?;
        self.free_list
            .free(offset)
            .map_err(|_| FreeError::NotAllocated(*chunk))?;
        segment.set_chunk_units(chunk.chunk, 0);
        Ok(())
    }
}

impl ShmProviderBackend for PosixHeapBackend {
    fn alloc(&mut self, len: usize) -> Result<AllocatedChunk, AllocError> {
        if self.torn_down {
            return Err(AllocError::TornDown);
        }
        // Check the request before a segment exists so constraint errors never
        // create one.
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }
        let max = self.free_list.capacity();
        if len > max {
            return Err(AllocError::TooLarge { len, max });
        }
        let segment = self.ensure_segment()?;

        let offset = self.free_list.alloc(len).map_err(|e| match e {
            FreeListError::ZeroLength => AllocError::ZeroLength,
            FreeListError::TooLarge { len, max } => AllocError::TooLarge { len, max },
            FreeListError::NeedDefragment => AllocError::NeedDefragment,
            FreeListError::OutOfMemory | FreeListError::NotAllocated { .. } => {
                AllocError::OutOfMemory
            }
        });
        let offset = match offset {
            Ok(offset) => offset,
            Err(e) => {
                trace!(segment = segment.id, len, error = %e, "heap alloc failed");
                return Err(e);
            }
        };
        let block_len = self.free_list.block_len(offset).unwrap_or(len);

        // SAFETY: the free list only hands out offsets inside the data area.
        let data = unsafe {
            segment
                .mapping
                .region()
                .offset(self.geometry.data_offset + offset)
        };
        let data = NonNull::new(data).ok_or(AllocError::OutOfMemory)?;

        let chunk = (offset / self.config.alignment) as ChunkId;
        segment.set_chunk_units(chunk, (block_len / self.config.alignment) as u32);
        trace!(segment = segment.id, chunk, offset, len, block_len, "alloc");
        Ok(AllocatedChunk {
            descriptor: ChunkDescriptor::new(segment.id, chunk),
            data,
            len: block_len,
        })
    }

    fn free(&mut self, chunk: &ChunkDescriptor) -> Result<(), FreeError> {
        match self.check_free(chunk) {
            Ok(()) => {
                trace!(%chunk, "free");
                Ok(())
            }
            Err(e) => {
                warn!(%chunk, error = %e, "rejected free");
                Err(e)
            }
        }
    }

    fn defragment(&mut self) -> usize {
        if self.torn_down {
            return 0;
        }
        let largest = self.free_list.defragment();
        debug!(
            largest,
            free = self.free_list.free_bytes(),
            live = self.free_list.live_count(),
            "defragmented heap"
        );
        largest
    }

    fn available(&self) -> usize {
        if self.torn_down {
            0
        } else {
            self.free_list.free_bytes()
        }
    }

    fn max_chunk_size(&self) -> usize {
        self.free_list.capacity()
    }

    fn recognizes(&self, chunk: &ChunkDescriptor) -> bool {
        !self.torn_down
            && self.segment_id() == Some(chunk.segment)
            && self.chunk_offset(chunk.chunk).is_some()
    }

    fn local_segment(&self, segment: SegmentId) -> Option<Arc<dyn ShmSegment>> {
        let own = self.segment.as_ref().filter(|s| s.id == segment)?;
        Some(Arc::clone(own) as Arc<dyn ShmSegment>)
    }

    fn teardown(&mut self) -> Result<(), ShmError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let result = segment.mapping.unlink();
        if let Err(e) = &result {
            warn!(segment = segment.id, error = %e, "failed to unlink heap segment");
        }
        debug!(segment = segment.id, name = segment.mapping.name(), "tore down heap segment");
        result
    }
}

impl Drop for PosixHeapBackend {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Consumer side of the heap protocol.
#[derive(Debug, Clone)]
pub struct PosixHeapClient {
    name_prefix: String,
}

impl PosixHeapClient {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
        }
    }
}

impl Default for PosixHeapClient {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAME_PREFIX)
    }
}

impl ShmClient for PosixHeapClient {
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>, ShmError> {
        Ok(Arc::new(PosixHeapSegment::open(&self.name_prefix, segment)?))
    }
}

/// A mapped heap segment, in the producer or in a consumer.
pub struct PosixHeapSegment {
    id: SegmentId,
    geometry: SegmentGeometry,
    mapping: ShmMapping,
}

impl PosixHeapSegment {
    pub fn open(prefix: &str, id: SegmentId) -> Result<Self, ShmError> {
        let name = segment_name(prefix, POSIX_HEAP_PROTOCOL_ID, id);
        let mapping = ShmMapping::open(&name).map_err(|source| ShmError::Unavailable {
            name: name.clone(),
            source,
        })?;
        let region = mapping.region();
        if region.len() < HEADER_SIZE {
            return Err(ShmError::Layout {
                name,
                reason: format!("{} bytes is too small for a header", region.len()),
            });
        }
        // SAFETY: in bounds and page aligned.
        let header = unsafe { region.get::<SegmentHeader>(0) };
        let geometry = header.read(&name, POSIX_HEAP_PROTOCOL_ID, region.len())?;
        let unit = geometry.chunk_unit as usize;
        if unit == 0 || (geometry.chunk_count as usize).checked_mul(unit) != Some(geometry.data_len)
        {
            return Err(ShmError::Layout {
                name,
                reason: format!(
                    "{} chunks of {unit} bytes don't fill {} bytes",
                    geometry.chunk_count, geometry.data_len
                ),
            });
        }
        if lengths_end(geometry.chunk_count).is_none_or(|end| end > geometry.data_offset) {
            return Err(ShmError::Layout {
                name,
                reason: format!(
                    "length table for {} chunks overlaps the data area at {}",
                    geometry.chunk_count, geometry.data_offset
                ),
            });
        }

        debug!(%name, segment = id, capacity = geometry.data_len, "attached heap segment");
        Ok(Self {
            id,
            geometry,
            mapping,
        })
    }

    /// Length-table entry of `chunk`.
    fn chunk_units(&self, chunk: ChunkId) -> Option<&AtomicU32> {
        if chunk >= self.geometry.chunk_count {
            return None;
        }
        let offset = LENGTHS_OFFSET + chunk as usize * size_of::<u32>();
        // SAFETY: the table lies between the header and the data area (checked
        // in `open`, constructed so in `create_segment`), u32 aligned, and only
        // ever accessed atomically.
        Some(unsafe { &*(self.mapping.region().offset(offset) as *const AtomicU32) })
    }

    fn set_chunk_units(&self, chunk: ChunkId, units: u32) {
        if let Some(entry) = self.chunk_units(chunk) {
            entry.store(units, Ordering::Release);
        }
    }
}

impl fmt::Debug for PosixHeapSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixHeapSegment")
            .field("id", &self.id)
            .field("name", &self.mapping.name())
            .field("capacity", &self.geometry.data_len)
            .finish()
    }
}

impl ShmSegment for PosixHeapSegment {
    fn map(&self, chunk: ChunkId) -> Result<ChunkPtr, ShmError> {
        let out_of_range = ShmError::ChunkOutOfRange {
            segment: self.id,
            chunk,
        };
        let units = self
            .chunk_units(chunk)
            .ok_or(out_of_range)?
            .load(Ordering::Acquire);
        if units == 0 {
            return Err(ShmError::ChunkNotLive {
                segment: self.id,
                chunk,
            });
        }
        let unit = self.geometry.chunk_unit as usize;
        let offset = chunk as usize * unit;
        let len = units as usize * unit;
        // The table lives in shared memory; never trust it past the data area.
        if len > self.geometry.data_len - offset {
            return Err(ShmError::ChunkOutOfRange {
                segment: self.id,
                chunk,
            });
        }
        // SAFETY: offset < data_len, and the data area lies inside the mapping.
        let data = unsafe { self.mapping.region().offset(self.geometry.data_offset + offset) };
        let data = NonNull::new(data).ok_or(ShmError::ChunkOutOfRange {
            segment: self.id,
            chunk,
        })?;
        trace!(segment = self.id, chunk, len, "map");
        Ok(ChunkPtr { data, len })
    }

    fn id(&self) -> SegmentId {
        self.id
    }
}
