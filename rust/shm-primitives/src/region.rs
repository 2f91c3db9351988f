use core::mem::{align_of, size_of};

/// A borrowed view over a contiguous range of memory.
///
/// The region does not own its memory. For a shared memory segment the owner
/// is whatever holds the `mmap`; for tests it is a [`HeapRegion`].
#[derive(Clone, Copy, Debug)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: Region is a plain pointer + length. Synchronization of the pointee
// is the responsibility of the structures laid out inside it (atomics).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a base pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// this region (or anything built on it) is used.
    #[inline]
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        debug_assert!(!base.is_null());
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `[offset, offset + len)` lies inside the region.
    #[inline]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be `<= self.len()`.
    #[inline]
    pub unsafe fn offset(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.base.add(offset) }
    }

    /// Shared reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be aligned for `T`, in bounds, and point to an initialized
    /// `T` that is only mutated through interior mutability.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(self.contains(offset, size_of::<T>()));
        debug_assert!((self.base as usize + offset).is_multiple_of(align_of::<T>()));
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutable reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// Same as [`Region::get`], and no other reference to the same `T` may be
    /// alive (in this or any other process) while the returned one is used.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        debug_assert!(self.contains(offset, size_of::<T>()));
        debug_assert!((self.base as usize + offset).is_multiple_of(align_of::<T>()));
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }
}

/// Heap-backed, zero-initialized, 64-byte aligned memory.
///
/// Used by tests and by callers that want slab semantics without a mapping.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: *mut u8,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` overflows a valid layout; aborts on allocation failure.
    pub fn new_zeroed(len: usize) -> Self {
        let layout = match alloc::alloc::Layout::from_size_align(len.max(1), 64) {
            Ok(layout) => layout,
            Err(_) => panic!("heap region of {len} bytes exceeds the address space"),
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    /// A [`Region`] view of this allocation.
    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as `self`.
        unsafe { Region::from_raw(self.ptr, self.layout.size()) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with the same layout.
        unsafe { alloc::alloc::dealloc(self.ptr, self.layout) };
    }
}
