//! Fixed-slot protocol.
//!
//! ```text
//! 0        64                     data_offset
//! ┌────────┬──────────────────────┬──────────────────────────────┐
//! │ header │ TreiberSlab header   │ slot 0 │ slot 1 │ ...        │
//! │        │ + SlotMeta × count   │                              │
//! └────────┴──────────────────────┴──────────────────────────────┘
//! ```
//!
//! Chunk ids are slot indices. A fresh segment hands out 0, 1, 2, ... in
//! order; freed slots are reused most-recent-first.

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use shm_primitives::{AllocResult as SlabAlloc, SlabLayout, SlotError, TreiberSlab};
use tracing::{debug, trace, warn};

use super::layout::{HEADER_SIZE, SegmentGeometry, SegmentHeader};
use super::mapping::ShmMapping;
use super::segment_id::{MAX_ID_ATTEMPTS, SegmentIdGenerator};
use super::{POSIX_SLOT_PROTOCOL_ID, segment_name};
use crate::backend::ShmProviderBackend;
use crate::client::{ShmClient, ShmSegment};
use crate::config::SlotBackendConfig;
use crate::error::{AllocError, FreeError, ShmError};
use crate::types::{AllocatedChunk, ChunkDescriptor, ChunkId, ChunkPtr, SegmentId};

/// Snapshot of slot usage in one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub segment: SegmentId,
    pub total: u32,
    pub slot_size: u32,
    /// Slots whose state word says allocated.
    pub allocated: u32,
    /// The slab's allocation counter (should match `allocated`).
    pub counted: u32,
}

impl SlotStatus {
    fn scan(segment: SegmentId, slab: &TreiberSlab) -> Self {
        let allocated = (0..slab.slot_count())
            .filter(|&i| slab.is_allocated(i))
            .count() as u32;
        Self {
            segment,
            total: slab.slot_count(),
            slot_size: slab.slot_size(),
            allocated,
            counted: slab.allocated_count(),
        }
    }

    pub fn free(&self) -> u32 {
        self.total - self.allocated
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {}: {}/{} slots free ({}B each), {} allocated",
            self.segment,
            self.free(),
            self.total,
            self.slot_size,
            self.allocated
        )?;
        if self.counted != self.allocated {
            write!(f, " [counter says {}]", self.counted)?;
        }
        Ok(())
    }
}

fn slab_len(slot_count: u32, slot_size: u32) -> Result<SlabLayout, ShmError> {
    SlabLayout::compute(HEADER_SIZE, slot_count, slot_size)
        .map_err(|e| ShmError::InvalidConfig(e.to_string()))
}

/// Producer side of the slot protocol.
///
/// `slot_count` slots of `slot_size` bytes each in a single segment. The
/// backend's mapping is shared with local readers as a [`PosixSlotSegment`],
/// so it stays mapped until the last of them is gone.
pub struct PosixSlotBackend {
    config: SlotBackendConfig,
    layout: SlabLayout,
    ids: SegmentIdGenerator,
    segment: Option<Arc<PosixSlotSegment>>,
    torn_down: bool,
}

impl PosixSlotBackend {
    /// Validate `config`. No OS resource is created until the first `alloc`.
    pub fn new(config: SlotBackendConfig) -> Result<Self, ShmError> {
        config.validate()?;
        let layout = slab_len(config.slot_count, config.slot_size)?;
        Ok(Self {
            config,
            layout,
            ids: SegmentIdGenerator::new(),
            segment: None,
            torn_down: false,
        })
    }

    /// Id of the backing segment, once created.
    pub fn segment_id(&self) -> Option<SegmentId> {
        self.segment.as_ref().map(|s| s.id)
    }

    pub fn config(&self) -> &SlotBackendConfig {
        &self.config
    }

    pub fn status(&self) -> Option<SlotStatus> {
        self.segment
            .as_ref()
            .map(|s| SlotStatus::scan(s.id, &s.slab))
    }

    fn ensure_segment(&mut self) -> Result<&Arc<PosixSlotSegment>, AllocError> {
        if self.torn_down {
            return Err(AllocError::TornDown);
        }
        let segment = match self.segment.take() {
            Some(segment) => segment,
            None => Arc::new(self.create_segment()?),
        };
        Ok(&*self.segment.insert(segment))
    }

    fn create_segment(&self) -> Result<PosixSlotSegment, AllocError> {
        let len = self.layout.end;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id();
            let name = segment_name(&self.config.name_prefix, POSIX_SLOT_PROTOCOL_ID, id);
            let mapping = match ShmMapping::create(&name, len) {
                Ok(mapping) => mapping,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(%name, "segment id in use, retrying");
                    continue;
                }
                Err(e) => return Err(AllocError::SegmentUnavailable(format!("{name}: {e}"))),
            };

            // SAFETY: the mapping was just created with O_EXCL; nobody else
            // can have opened it before its name is handed out.
            let slab = unsafe {
                TreiberSlab::init(
                    mapping.region(),
                    HEADER_SIZE,
                    self.config.slot_count,
                    self.config.slot_size,
                )
            };
            let slab = match slab {
                Ok(slab) => slab,
                Err(e) => {
                    let _ = mapping.unlink();
                    return Err(AllocError::SegmentUnavailable(format!("{name}: {e}")));
                }
            };
            let geometry = SegmentGeometry {
                protocol: POSIX_SLOT_PROTOCOL_ID,
                data_offset: self.layout.data_offset,
                data_len: self.layout.end - self.layout.data_offset,
                chunk_unit: self.config.slot_size,
                chunk_count: self.config.slot_count,
            };
            // SAFETY: offset 0 is page aligned and still private to us.
            unsafe { SegmentHeader::write(mapping.region().as_ptr(), &geometry) };

            debug!(
                %name,
                segment = id,
                slot_count = self.config.slot_count,
                slot_size = self.config.slot_size,
                len,
                "created slot segment"
            );
            return Ok(PosixSlotSegment { id, slab, mapping });
        }
        Err(AllocError::SegmentUnavailable(format!(
            "no unused segment id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    fn check_free(&self, chunk: &ChunkDescriptor) -> Result<(), FreeError> {
        if self.torn_down {
            return Err(FreeError::TornDown);
        }
        let segment = match &self.segment {
            Some(segment) if segment.id == chunk.segment => segment,
            other => {
                return Err(FreeError::ForeignSegment {
                    descriptor: *chunk,
                    owned: other.as_ref().map(|s| s.id),
                });
            }
        };
        segment.slab.free(chunk.chunk).map_err(|e| match e {
            SlotError::InvalidIndex { .. } => FreeError::InvalidChunk(*chunk),
            SlotError::InvalidState { .. } => FreeError::NotAllocated(*chunk),
        })
    }
}

impl ShmProviderBackend for PosixSlotBackend {
    fn alloc(&mut self, len: usize) -> Result<AllocatedChunk, AllocError> {
        if self.torn_down {
            return Err(AllocError::TornDown);
        }
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }
        let max = self.config.slot_size as usize;
        if len > max {
            return Err(AllocError::TooLarge { len, max });
        }

        let segment = self.ensure_segment()?;
        let handle = match segment.slab.try_alloc() {
            SlabAlloc::Ok(handle) => handle,
            SlabAlloc::Exhausted => {
                trace!(segment = segment.id, len, "slot segment exhausted");
                return Err(AllocError::OutOfMemory);
            }
        };
        let data = segment
            .slab
            .slot_ptr(handle.index)
            .ok()
            .and_then(NonNull::new)
            .ok_or(AllocError::OutOfMemory)?;

        trace!(
            segment = segment.id,
            slot = handle.index,
            generation = handle.generation,
            len,
            "alloc"
        );
        Ok(AllocatedChunk {
            descriptor: ChunkDescriptor::new(segment.id, handle.index),
            data,
            len: max,
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
        // Slots never fragment.
        match &self.segment {
            _ if self.torn_down => 0,
            Some(segment) if segment.slab.free_count() == 0 => 0,
            _ => self.config.slot_size as usize,
        }
    }

    fn available(&self) -> usize {
        let slot_size = self.config.slot_size as usize;
        match &self.segment {
            _ if self.torn_down => 0,
            Some(segment) => segment.slab.free_count() as usize * slot_size,
            None => self.config.slot_count as usize * slot_size,
        }
    }

    fn max_chunk_size(&self) -> usize {
        self.config.slot_size as usize
    }

    fn recognizes(&self, chunk: &ChunkDescriptor) -> bool {
        !self.torn_down
            && self
                .segment
                .as_ref()
                .is_some_and(|s| s.id == chunk.segment && chunk.chunk < s.slab.slot_count())
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
            warn!(segment = segment.id, error = %e, "failed to unlink slot segment");
        }
        debug!(segment = segment.id, name = segment.mapping.name(), "tore down slot segment");
        result
    }
}

impl Drop for PosixSlotBackend {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Consumer side of the slot protocol.
#[derive(Debug, Clone)]
pub struct PosixSlotClient {
    name_prefix: String,
}

impl PosixSlotClient {
    /// Client for segments created with the same `name_prefix`.
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
        }
    }
}

impl Default for PosixSlotClient {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAME_PREFIX)
    }
}

impl ShmClient for PosixSlotClient {
    fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>, ShmError> {
        Ok(Arc::new(PosixSlotSegment::open(&self.name_prefix, segment)?))
    }
}

/// A slot segment mapped by a consumer.
pub struct PosixSlotSegment {
    id: SegmentId,
    slab: TreiberSlab,
    mapping: ShmMapping,
}

impl PosixSlotSegment {
    pub fn open(prefix: &str, id: SegmentId) -> Result<Self, ShmError> {
        let name = segment_name(prefix, POSIX_SLOT_PROTOCOL_ID, id);
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
        // SAFETY: in bounds (checked above) and page aligned.
        let header = unsafe { region.get::<SegmentHeader>(0) };
        let geometry = header.read(&name, POSIX_SLOT_PROTOCOL_ID, region.len())?;

        // SAFETY: the header says the creator initialized a slab at HEADER_SIZE;
        // attach re-validates its geometry against the mapping.
        let slab = unsafe { TreiberSlab::attach(region, HEADER_SIZE) }.map_err(|e| {
            ShmError::Layout {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        if slab.slot_count() != geometry.chunk_count
            || slab.slot_size() != geometry.chunk_unit
            || slab.layout().data_offset != geometry.data_offset
        {
            return Err(ShmError::Layout {
                name,
                reason: "slab geometry disagrees with segment header".into(),
            });
        }

        debug!(%name, segment = id, slot_count = slab.slot_count(), "attached slot segment");
        Ok(Self { id, slab, mapping })
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::scan(self.id, &self.slab)
    }
}

impl fmt::Debug for PosixSlotSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixSlotSegment")
            .field("id", &self.id)
            .field("name", &self.mapping.name())
            .field("slot_count", &self.slab.slot_count())
            .field("slot_size", &self.slab.slot_size())
            .finish()
    }
}

impl ShmSegment for PosixSlotSegment {
    fn map(&self, chunk: ChunkId) -> Result<ChunkPtr, ShmError> {
        let out_of_range = ShmError::ChunkOutOfRange {
            segment: self.id,
            chunk,
        };
        let data = self
            .slab
            .slot_ptr(chunk)
            .ok()
            .and_then(NonNull::new)
            .ok_or(out_of_range)?;
        trace!(segment = self.id, chunk, "map");
        Ok(ChunkPtr {
            data,
            len: self.slab.slot_size() as usize,
        })
    }

    fn id(&self) -> SegmentId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn config(slot_count: u32, slot_size: u32) -> SlotBackendConfig {
        SlotBackendConfig {
            slot_count,
            slot_size,
            name_prefix: format!(
                "slot-unit-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    #[test]
    fn segment_is_created_lazily() {
        let mut backend = PosixSlotBackend::new(config(4, 64)).unwrap();
        assert_eq!(backend.segment_id(), None);
        assert_eq!(backend.available(), 256);

        let chunk = backend.alloc(10).unwrap();
        assert_eq!(backend.segment_id(), Some(chunk.descriptor.segment));
        assert_eq!(chunk.len, 64);
        assert_eq!(backend.available(), 192);
        backend.teardown().unwrap();
    }

    #[test]
    fn constraint_errors() {
        let mut backend = PosixSlotBackend::new(config(4, 64)).unwrap();
        assert_eq!(backend.alloc(0), Err(AllocError::ZeroLength));
        let err = backend.alloc(65).unwrap_err();
        assert_eq!(err, AllocError::TooLarge { len: 65, max: 64 });
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        // Constraint failures don't create a segment.
        assert_eq!(backend.segment_id(), None);
    }

    #[test]
    fn free_violations_leave_state_alone() {
        let mut backend = PosixSlotBackend::new(config(4, 64)).unwrap();
        let chunk = backend.alloc(8).unwrap().descriptor;

        let foreign = ChunkDescriptor::new(chunk.segment.wrapping_add(1), chunk.chunk);
        assert!(matches!(
            backend.free(&foreign),
            Err(FreeError::ForeignSegment { .. })
        ));
        let bogus = ChunkDescriptor::new(chunk.segment, 99);
        assert_eq!(backend.free(&bogus), Err(FreeError::InvalidChunk(bogus)));
        assert_eq!(backend.status().unwrap().allocated, 1);

        backend.free(&chunk).unwrap();
        assert_eq!(backend.free(&chunk), Err(FreeError::NotAllocated(chunk)));
        let status = backend.status().unwrap();
        assert_eq!((status.allocated, status.counted), (0, 0));
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut backend = PosixSlotBackend::new(config(2, 64)).unwrap();
        let chunk = backend.alloc(8).unwrap().descriptor;
        let prefix = backend.config().name_prefix.clone();

        backend.teardown().unwrap();
        backend.teardown().unwrap();
        assert_eq!(backend.alloc(8), Err(AllocError::TornDown));
        assert_eq!(backend.free(&chunk), Err(FreeError::TornDown));
        assert_eq!(backend.available(), 0);

        let err = PosixSlotSegment::open(&prefix, chunk.segment).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn consumer_sees_producer_bytes_and_status() {
        let mut backend = PosixSlotBackend::new(config(8, 128)).unwrap();
        let chunk = backend.alloc(5).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), chunk.data.as_ptr(), 5);
        }

        let client = PosixSlotClient::new(backend.config().name_prefix.clone());
        let segment = client.attach(chunk.descriptor.segment).unwrap();
        let ptr = segment.map(chunk.descriptor.chunk).unwrap();
        assert_eq!(ptr.len, 128);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.data.as_ptr(), 5) };
        assert_eq!(bytes, b"hello");

        assert!(matches!(
            segment.map(8),
            Err(ShmError::ChunkOutOfRange { chunk: 8, .. })
        ));

        let remote = PosixSlotSegment::open(
            &backend.config().name_prefix,
            chunk.descriptor.segment,
        )
        .unwrap();
        assert_eq!(remote.status(), backend.status().unwrap());
        assert_eq!(remote.status().to_string(), format!(
            "segment {}: 7/8 slots free (128B each), 1 allocated",
            chunk.descriptor.segment
        ));
        backend.teardown().unwrap();
    }

    #[test]
    fn local_segment_shares_the_producer_mapping() {
        let mut backend = PosixSlotBackend::new(config(2, 64)).unwrap();
        assert!(backend.local_segment(0).is_none());
        let chunk = backend.alloc(4).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(b"mine".as_ptr(), chunk.data.as_ptr(), 4) };

        let segment = chunk.descriptor.segment;
        assert!(backend.local_segment(segment.wrapping_add(1)).is_none());
        let local = backend.local_segment(segment).unwrap();
        assert_eq!(local.id(), segment);
        let ptr = local.map(chunk.descriptor.chunk).unwrap();
        assert_eq!(ptr.data, chunk.data);

        // Unlinked, but still mapped while `local` lives.
        backend.teardown().unwrap();
        assert!(backend.local_segment(segment).is_none());
        let bytes = unsafe { std::slice::from_raw_parts(ptr.data.as_ptr(), 4) };
        assert_eq!(bytes, b"mine");
    }
}
