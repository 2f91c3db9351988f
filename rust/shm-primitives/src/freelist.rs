//! Offset-keyed free list for variable-size allocations.
//!
//! The list tracks `[offset, offset + len)` blocks of an address range it never
//! touches; it is pure bookkeeping and lives in the allocating process only.
//!
//! Freed blocks are *not* merged with their neighbours on `free`. Merging
//! happens in [`OffsetFreeList::defragment`], which is why an allocation can
//! fail with [`FreeListError::NeedDefragment`] while enough bytes are free in
//! total. Once a defragment pass has run and nothing was freed since, a failed
//! fit is reported as [`FreeListError::OutOfMemory`] instead: compaction cannot
//! move live blocks, so retrying would not help.

use alloc::collections::BTreeMap;
use core::fmt;

/// Why an allocation or free was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListError {
    ZeroLength,
    TooLarge { len: usize, max: usize },
    OutOfMemory,
    NeedDefragment,
    /// `offset` is not the start of a live block.
    NotAllocated { offset: usize },
}

impl fmt::Display for FreeListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeListError::ZeroLength => write!(f, "zero-length allocation"),
            FreeListError::TooLarge { len, max } => {
                write!(f, "allocation of {len} bytes exceeds capacity of {max} bytes")
            }
            FreeListError::OutOfMemory => write!(f, "out of memory"),
            FreeListError::NeedDefragment => write!(f, "free space is fragmented"),
            FreeListError::NotAllocated { offset } => {
                write!(f, "no live allocation starts at offset {offset}")
            }
        }
    }
}

/// First-fit allocator over `[0, capacity)` with lazy coalescing.
#[derive(Debug, Clone)]
pub struct OffsetFreeList {
    capacity: usize,
    alignment: usize,
    /// offset -> len of free blocks.
    free: BTreeMap<usize, usize>,
    /// offset -> len of live blocks.
    used: BTreeMap<usize, usize>,
    free_bytes: usize,
    /// Set by `free`, cleared by `defragment`.
    fragmented: bool,
}

impl OffsetFreeList {
    /// Manage `capacity` bytes, handing out blocks aligned to `alignment`.
    ///
    /// `capacity` is rounded down to a multiple of `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn new(capacity: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let capacity = capacity & !(alignment - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            alignment,
            free,
            used: BTreeMap::new(),
            free_bytes: capacity,
            fragmented: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Total free bytes, contiguous or not.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Size of the largest free block in the current layout.
    pub fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Number of live blocks.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.used.len()
    }

    /// Length of the live block starting at `offset`.
    pub fn block_len(&self, offset: usize) -> Option<usize> {
        self.used.get(&offset).copied()
    }

    /// Allocate at least `len` bytes. Returns the block's offset.
    pub fn alloc(&mut self, len: usize) -> Result<usize, FreeListError> {
        if len == 0 {
            return Err(FreeListError::ZeroLength);
        }
        let size = match len.checked_add(self.alignment - 1) {
            Some(v) if v & !(self.alignment - 1) <= self.capacity => v & !(self.alignment - 1),
            _ => {
                return Err(FreeListError::TooLarge {
                    len,
                    max: self.capacity,
                });
            }
        };
        if size > self.free_bytes {
            return Err(FreeListError::OutOfMemory);
        }

        let found = self
            .free
            .iter()
            .find(|&(_, &block)| block >= size)
            .map(|(&offset, &block)| (offset, block));

        let Some((offset, block)) = found else {
            return Err(if self.fragmented {
                FreeListError::NeedDefragment
            } else {
                FreeListError::OutOfMemory
            });
        };

        self.free.remove(&offset);
        if block > size {
            self.free.insert(offset + size, block - size);
        }
        self.used.insert(offset, size);
        self.free_bytes -= size;
        Ok(offset)
    }

    /// Return the block starting at `offset`. Returns its length.
    ///
    /// An offset that is not the start of a live block is rejected and the
    /// bookkeeping is left unchanged.
    pub fn free(&mut self, offset: usize) -> Result<usize, FreeListError> {
        let len = self
            .used
            .remove(&offset)
            .ok_or(FreeListError::NotAllocated { offset })?;
        self.free.insert(offset, len);
        self.free_bytes += len;
        self.fragmented = true;
        Ok(len)
    }

    /// Merge adjacent free blocks. Live blocks never move.
    ///
    /// Returns the size of the largest free block afterwards.
    pub fn defragment(&mut self) -> usize {
        let mut merged = BTreeMap::new();
        let mut current: Option<(usize, usize)> = None;

        for (&offset, &len) in &self.free {
            current = match current {
                Some((start, run)) if start + run == offset => Some((start, run + len)),
                Some((start, run)) => {
                    merged.insert(start, run);
                    Some((offset, len))
                }
                None => Some((offset, len)),
            };
        }
        if let Some((start, run)) = current {
            merged.insert(start, run);
        }

        self.free = merged;
        self.fragmented = false;
        self.largest_free()
    }
}
