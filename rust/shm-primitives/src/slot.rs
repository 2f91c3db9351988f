use crate::sync::{AtomicU32, Ordering};

/// Lifecycle of a slab slot.
///
/// The slab only distinguishes free and allocated slots. Whether an allocated
/// slot is still being written, travelling to another process, or mapped there
/// is tracked (if at all) by the application.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Allocated = 1,
}

impl SlotState {
    #[inline]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Allocated),
            _ => None,
        }
    }
}

/// Per-slot metadata stored next to the slot data (12 bytes).
#[repr(C)]
pub struct SlotMeta {
    /// Bumped on every allocation of this slot.
    pub generation: AtomicU32,
    /// Current [`SlotState`] as `u32`.
    pub state: AtomicU32,
    /// Next free slot while this one is on the free list.
    pub next_free: AtomicU32,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SlotMeta>() == 12);

impl SlotMeta {
    /// A fresh, free slot.
    pub fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            state: AtomicU32::new(SlotState::Free as u32),
            next_free: AtomicU32::new(u32::MAX),
        }
    }

    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `from` to `to`.
    ///
    /// On failure returns the state actually observed.
    #[inline]
    pub fn try_transition(&self, from: SlotState, to: SlotState) -> Result<(), SlotState> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| SlotState::from_u32(actual).unwrap_or(SlotState::Free))
    }
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self::new()
    }
}
