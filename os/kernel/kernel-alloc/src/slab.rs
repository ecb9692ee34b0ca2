//! # Slab Allocator
//!
//! Fixed-size object pools carved out of whole pages.
//!
//! A [`SlabCache`] serves one object size and alignment. Each slab is one
//! page: a small header followed by equally sized slots.
//!
//! ```text
//! page ┌────────┬────────────┬──────────────┬──────────────┬─────┬──────┐
//!      │ header │ free stack │    slot 0    │    slot 1    │ ... │ tail │
//!      └────────┴────────────┴──────────────┴──────────────┴─────┴──────┘
//! slot ┌──────────┬───────────────────┬──────────┬─────────┐
//!      │ (canary) │      object       │ (canary) │ padding │
//!      └──────────┴───────────────────┴──────────┴─────────┘
//! ```
//!
//! ## Slab lifecycle
//!
//! ```text
//!            first alloc          slab fills
//!   Empty ───────────────► Partial ──────────► Full
//!     ▲                     │   ▲                │
//!     └─────────────────────┘   └────────────────┘
//!        last object freed          any free
//!
//!   any state ── corruption detected ──► Quarantine ── purge ──► released
//! ```
//!
//! All bookkeeping lives in the slab page: the header carries the owning
//! cache id, the links of one of four per-state lists and the live-slot
//! bitmap, followed by the free-slot stack. `free` finds the slab by masking
//! the object address, and growing a cache needs nothing but a page from its
//! [`PageProvider`], so a general-purpose allocator can be layered on top.
//!
//! ## Corruption detection
//!
//! With [`SlabConfig::canaries`] each object is bracketed by canary words,
//! checked when the object is freed, and freed objects are filled with a
//! poison byte that is verified before the slot is handed out again. A
//! mismatch quarantines the whole slab instead of reusing it.

mod cache;
mod layout;
mod page;

pub use crate::slab::cache::{SlabCache, SlabCacheStats};
use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;

/// Source of whole, page-aligned pages for slabs.
pub trait PageProvider {
    /// `count` zeroed, page-aligned, writable pages, or `None` when memory is exhausted.
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>>;

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages).
    fn free_pages(&mut self, base: NonNull<u8>, count: usize);
}

impl<P: PageProvider + ?Sized> PageProvider for &mut P {
    #[inline]
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        (**self).alloc_pages(count)
    }

    #[inline]
    fn free_pages(&mut self, base: NonNull<u8>, count: usize) {
        (**self).free_pages(base, count);
    }
}

/// Optional per-object hook, called with the object's address.
pub type ObjectHook = fn(NonNull<u8>);

/// Per-cache tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabConfig {
    /// Empty slabs kept for reuse; further empty slabs go back to the page layer.
    pub max_empty_slabs: usize,
    /// Bracket objects with canaries and poison freed objects.
    pub canaries: bool,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            max_empty_slabs: 2,
            canaries: cfg!(debug_assertions),
        }
    }
}

/// Which list a slab belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum SlabState {
    Empty,
    Partial,
    Full,
    /// Corruption was detected; never allocated from again.
    Quarantine,
}

impl SlabState {
    pub const ALL: [Self; 4] = [Self::Empty, Self::Partial, Self::Full, Self::Quarantine];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlabError {
    #[error("object size must be non-zero")]
    ZeroSized,
    #[error("alignment {0} is not a power of two up to the page size")]
    InvalidAlignment(usize),
    #[error("objects of {0} bytes do not fit in a slab")]
    ObjectTooLarge(usize),
    #[error("the page layer is out of memory")]
    OutOfMemory,
    #[error("{0} does not belong to this cache")]
    ForeignObject(VirtualAddress),
    #[error("{0} is not the start of an object slot")]
    Misaligned(VirtualAddress),
    #[error("{0} lies in a quarantined slab")]
    Quarantined(VirtualAddress),
    #[error("double free of {0}")]
    DoubleFree(VirtualAddress),
    #[error("canary around {0} was overwritten; slab quarantined")]
    Corrupted(VirtualAddress),
}
