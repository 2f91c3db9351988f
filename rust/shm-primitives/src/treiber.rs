//! Lock-free fixed-size slot allocator living inside a region.
//!
//! ```text
//! header_offset ─► ┌──────────────────────────────┐
//!                  │ TreiberSlabHeader (64 bytes)  │
//!                  ├──────────────────────────────┤
//!                  │ SlotMeta × slot_count         │
//!                  ├──────────────────────────────┤ (64-byte aligned)
//!                  │ slot data × slot_count        │
//!                  └──────────────────────────────┘
//! ```
//!
//! Free slots form a Treiber stack linked through [`SlotMeta::next_free`].
//! Slot data is never read or written by the allocator, so whatever lands in
//! a free slot cannot reach the free list. The head is `(tag << 32) | index`;
//! the tag is bumped on every push/pop so a stale CAS cannot succeed (ABA).
//!
//! A fresh slab hands out indices in ascending order (0, 1, 2, ...). Freed
//! slots are reused LIFO.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr;

use crate::region::Region;
use crate::slot::{SlotMeta, SlotState};
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// Sentinel value indicating end of free list.
pub const FREE_LIST_END: u32 = u32::MAX;

/// Slab data starts on a cache line.
const DATA_ALIGN: usize = 64;

/// Slab header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct TreiberSlabHeader {
    pub slot_size: u32,
    pub slot_count: u32,

    /// Free list head: index (low 32 bits) + tag (high 32 bits).
    pub free_head: AtomicU64,

    /// Number of slots currently allocated.
    pub allocated: AtomicU32,

    _pad: [u8; 44],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<TreiberSlabHeader>() == 64);

impl TreiberSlabHeader {
    fn new(slot_size: u32, slot_count: u32) -> Self {
        Self {
            slot_size,
            slot_count,
            free_head: AtomicU64::new(pack_free_head(FREE_LIST_END, 0)),
            allocated: AtomicU32::new(0),
            _pad: [0; 44],
        }
    }
}

/// Handle to an allocated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

/// Result of an allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocResult {
    Ok(SlotHandle),
    /// Every slot is allocated.
    Exhausted,
}

/// Errors returned by slot transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    InvalidIndex { index: u32, slot_count: u32 },
    InvalidState { expected: SlotState, actual: SlotState },
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::InvalidIndex { index, slot_count } => {
                write!(f, "slot index {index} out of range (slot_count = {slot_count})")
            }
            SlotError::InvalidState { expected, actual } => {
                write!(f, "slot is {actual:?}, expected {expected:?}")
            }
        }
    }
}

/// Why a slab cannot be laid out in (or attached from) a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabLayoutError {
    ZeroSlots,
    BadSlotSize(u32),
    MisalignedHeader(usize),
    Overflow,
    RegionTooSmall { required: usize, available: usize },
}

impl fmt::Display for SlabLayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlabLayoutError::ZeroSlots => write!(f, "slot_count must be > 0"),
            SlabLayoutError::BadSlotSize(size) => {
                write!(f, "slot_size {size} must be non-zero")
            }
            SlabLayoutError::MisalignedHeader(offset) => {
                write!(f, "header offset {offset} is not 64-byte aligned")
            }
            SlabLayoutError::Overflow => write!(f, "slab size overflows usize"),
            SlabLayoutError::RegionTooSmall { required, available } => {
                write!(f, "region too small for slab: need {required} bytes, have {available}")
            }
        }
    }
}

/// Byte offsets of a slab's parts, relative to the start of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabLayout {
    pub header_offset: usize,
    pub meta_offset: usize,
    pub data_offset: usize,
    /// One past the last data byte.
    pub end: usize,
}

impl SlabLayout {
    /// Compute the layout of a slab whose header sits at `header_offset`.
    pub fn compute(
        header_offset: usize,
        slot_count: u32,
        slot_size: u32,
    ) -> Result<Self, SlabLayoutError> {
        if slot_count == 0 || slot_count == FREE_LIST_END {
            return Err(SlabLayoutError::ZeroSlots);
        }
        if slot_size == 0 {
            return Err(SlabLayoutError::BadSlotSize(slot_size));
        }
        if !header_offset.is_multiple_of(64) {
            return Err(SlabLayoutError::MisalignedHeader(header_offset));
        }

        let meta_offset = align_up(
            header_offset
                .checked_add(size_of::<TreiberSlabHeader>())
                .ok_or(SlabLayoutError::Overflow)?,
            align_of::<SlotMeta>(),
        )
        .ok_or(SlabLayoutError::Overflow)?;
        let meta_len = (slot_count as usize)
            .checked_mul(size_of::<SlotMeta>())
            .ok_or(SlabLayoutError::Overflow)?;
        let data_offset = meta_offset
            .checked_add(meta_len)
            .and_then(|end| align_up(end, DATA_ALIGN))
            .ok_or(SlabLayoutError::Overflow)?;
        let end = (slot_count as usize)
            .checked_mul(slot_size as usize)
            .and_then(|len| len.checked_add(data_offset))
            .ok_or(SlabLayoutError::Overflow)?;

        Ok(Self {
            header_offset,
            meta_offset,
            data_offset,
            end,
        })
    }
}

/// A lock-free slab allocator backed by a region.
pub struct TreiberSlab {
    region: Region,
    layout: SlabLayout,
    slot_size: u32,
    slot_count: u32,
}

// SAFETY: all shared state lives in the region and is accessed via atomics.
unsafe impl Send for TreiberSlab {}
unsafe impl Sync for TreiberSlab {}

impl TreiberSlab {
    /// Initialize a new slab at `header_offset` in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        slot_count: u32,
        slot_size: u32,
    ) -> Result<Self, SlabLayoutError> {
        let layout = SlabLayout::compute(header_offset, slot_count, slot_size)?;
        if layout.end > region.len() {
            return Err(SlabLayoutError::RegionTooSmall {
                required: layout.end,
                available: region.len(),
            });
        }

        // SAFETY: layout checked against the region; caller guarantees exclusivity.
        unsafe {
            ptr::write(
                region.offset(header_offset) as *mut TreiberSlabHeader,
                TreiberSlabHeader::new(slot_size, slot_count),
            );
            for i in 0..slot_count as usize {
                ptr::write(
                    region.offset(layout.meta_offset + i * size_of::<SlotMeta>()) as *mut SlotMeta,
                    SlotMeta::new(),
                );
            }
        }

        let slab = Self {
            region,
            layout,
            slot_size,
            slot_count,
        };
        // SAFETY: still exclusively owned.
        unsafe { slab.init_free_list() };
        Ok(slab)
    }

    /// Attach to an existing slab.
    ///
    /// The header's geometry is re-validated against the region, so a corrupt
    /// or truncated segment is rejected instead of producing out-of-bounds
    /// pointers later.
    ///
    /// # Safety
    ///
    /// The region must contain a slab header at `header_offset` that was
    /// written by [`TreiberSlab::init`].
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, SlabLayoutError> {
        if !region.contains(header_offset, size_of::<TreiberSlabHeader>()) {
            return Err(SlabLayoutError::RegionTooSmall {
                required: header_offset.saturating_add(size_of::<TreiberSlabHeader>()),
                available: region.len(),
            });
        }
        if !header_offset.is_multiple_of(64) {
            return Err(SlabLayoutError::MisalignedHeader(header_offset));
        }
        // SAFETY: in bounds and aligned; caller guarantees it was initialized.
        let header = unsafe { region.get::<TreiberSlabHeader>(header_offset) };
        let (slot_count, slot_size) = (header.slot_count, header.slot_size);

        let layout = SlabLayout::compute(header_offset, slot_count, slot_size)?;
        if layout.end > region.len() {
            return Err(SlabLayoutError::RegionTooSmall {
                required: layout.end,
                available: region.len(),
            });
        }

        Ok(Self {
            region,
            layout,
            slot_size,
            slot_count,
        })
    }

    #[inline]
    fn header(&self) -> &TreiberSlabHeader {
        // SAFETY: validated in init/attach.
        unsafe { self.region.get::<TreiberSlabHeader>(self.layout.header_offset) }
    }

    /// # Safety
    ///
    /// `index < slot_count`.
    #[inline]
    unsafe fn meta(&self, index: u32) -> &SlotMeta {
        let off = self.layout.meta_offset + index as usize * size_of::<SlotMeta>();
        unsafe { self.region.get::<SlotMeta>(off) }
    }

    /// # Safety
    ///
    /// `index < slot_count`.
    #[inline]
    unsafe fn data_ptr(&self, index: u32) -> *mut u8 {
        let off = self.layout.data_offset + index as usize * self.slot_size as usize;
        unsafe { self.region.offset(off) }
    }

    /// # Safety
    ///
    /// `index < slot_count`.
    #[inline]
    unsafe fn read_next_free(&self, index: u32) -> u32 {
        unsafe { self.meta(index) }.next_free.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// `index < slot_count`.
    #[inline]
    unsafe fn write_next_free(&self, index: u32, next: u32) {
        unsafe { self.meta(index) }.next_free.store(next, Ordering::Release);
    }

    unsafe fn init_free_list(&self) {
        let slot_count = self.slot_count;
        for i in 0..slot_count - 1 {
            unsafe { self.write_next_free(i, i + 1) };
        }
        unsafe { self.write_next_free(slot_count - 1, FREE_LIST_END) };

        self.header()
            .free_head
            .store(pack_free_head(0, 0), Ordering::Release);
    }

    /// Try to allocate a slot.
    pub fn try_alloc(&self) -> AllocResult {
        let header = self.header();

        loop {
            let old_head = header.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack_free_head(old_head);

            if index == FREE_LIST_END {
                return AllocResult::Exhausted;
            }
            if index >= self.slot_count {
                // Another process scribbled over the head; refuse rather than
                // walk off the end of the slab.
                return AllocResult::Exhausted;
            }

            let next = unsafe { self.read_next_free(index) };
            let new_head = pack_free_head(next, tag.wrapping_add(1));

            match header.free_head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let meta = unsafe { self.meta(index) };
                    if meta
                        .try_transition(SlotState::Free, SlotState::Allocated)
                        .is_err()
                    {
                        self.push_to_free_list(index);
                        spin_loop();
                        continue;
                    }

                    header.allocated.fetch_add(1, Ordering::AcqRel);
                    let generation = meta.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                    return AllocResult::Ok(SlotHandle { index, generation });
                }
                Err(_) => {
                    spin_loop();
                    continue;
                }
            }
        }
    }

    /// Free an allocated slot and push it to the free list.
    ///
    /// Freeing a slot that is already free fails with
    /// [`SlotError::InvalidState`] and leaves the free list untouched.
    pub fn free(&self, index: u32) -> Result<(), SlotError> {
        self.check_index(index)?;

        let meta = unsafe { self.meta(index) };
        meta.try_transition(SlotState::Allocated, SlotState::Free)
            .map_err(|actual| SlotError::InvalidState {
                expected: SlotState::Allocated,
                actual,
            })?;

        self.header().allocated.fetch_sub(1, Ordering::AcqRel);
        self.push_to_free_list(index);
        Ok(())
    }

    /// Whether `index` is currently allocated. Out-of-range indices are not.
    pub fn is_allocated(&self, index: u32) -> bool {
        index < self.slot_count
            && unsafe { self.meta(index) }.state() == Some(SlotState::Allocated)
    }

    /// Generation of the slot's most recent allocation.
    pub fn generation(&self, index: u32) -> Result<u32, SlotError> {
        self.check_index(index)?;
        Ok(unsafe { self.meta(index) }.generation.load(Ordering::Acquire))
    }

    /// Bounds-checked pointer to the start of a slot's data.
    ///
    /// No memory is touched; dereferencing the pointer is up to the caller.
    pub fn slot_ptr(&self, index: u32) -> Result<*mut u8, SlotError> {
        self.check_index(index)?;
        // SAFETY: index checked above.
        Ok(unsafe { self.data_ptr(index) })
    }

    #[inline]
    fn check_index(&self, index: u32) -> Result<(), SlotError> {
        if index >= self.slot_count {
            return Err(SlotError::InvalidIndex {
                index,
                slot_count: self.slot_count,
            });
        }
        Ok(())
    }

    /// Returns the slot size in bytes.
    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Returns the total number of slots.
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Number of allocated slots.
    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.header().allocated.load(Ordering::Acquire)
    }

    /// Number of free slots, derived from the allocation counter.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.slot_count.saturating_sub(self.allocated_count())
    }

    #[inline]
    pub fn layout(&self) -> SlabLayout {
        self.layout
    }

    fn push_to_free_list(&self, index: u32) {
        let header = self.header();

        loop {
            let old_head = header.free_head.load(Ordering::Acquire);
            let (old_index, tag) = unpack_free_head(old_head);

            unsafe { self.write_next_free(index, old_index) };

            let new_head = pack_free_head(index, tag.wrapping_add(1));

            if header
                .free_head
                .compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }
}

#[inline]
fn pack_free_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_free_head(packed: u64) -> (u32, u32) {
    let index = packed as u32;
    let tag = (packed >> 32) as u32;
    (index, tag)
}

#[inline]
const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
