//! Atomics used by the allocators, swapped for loom's models under `loom`.

#[cfg(not(feature = "loom"))]
pub(crate) use core::{
    hint::spin_loop,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};
#[cfg(feature = "loom")]
pub(crate) use loom::{
    hint::spin_loop,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

#[cfg(feature = "loom")]
pub(crate) use loom::thread;
