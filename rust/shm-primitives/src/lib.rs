//! Allocator primitives for shared memory segments.
//!
//! This crate provides `no_std`-compatible building blocks for carving a
//! memory-mapped region into chunks. It knows nothing about protocols,
//! segment naming or processes: callers hand it a [`Region`] and get back
//! indices and offsets.
//!
//! # Primitives
//!
//! - [`TreiberSlab`]: lock-free fixed-size slot allocator. Its header and slot
//!   metadata live inside the region, so a second process can [`attach`] to the
//!   same memory and validate chunk indices without any out-of-band layout
//!   information.
//! - [`OffsetFreeList`] (requires `alloc`): process-local bookkeeping for
//!   variable-size allocations keyed by byte offset, with explicit coalescing.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the slab under every thread
//! interleaving:
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```
//!
//! [`attach`]: TreiberSlab::attach

#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(any(test, feature = "alloc"))]
pub mod freelist;
pub mod region;
pub mod slot;
mod sync;
pub mod treiber;

#[cfg(any(test, feature = "alloc"))]
pub use freelist::{FreeListError, OffsetFreeList};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use slot::{SlotMeta, SlotState};
pub use treiber::{
    AllocResult, SlabLayout, SlabLayoutError, SlotError, SlotHandle, TreiberSlab, TreiberSlabHeader,
};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
