//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel memory core.
//!
//! ## What you get
//! - An [`AddressSpace`] describing a `PML4` root page table plus the
//!   [`MemoryRegion`]s a task has declared in it.
//! - x86-64 page-table [`PageFlags`] in their architectural bit positions.
//! - A 4 KiB-aligned [`PageTable`] of [`PageTableEntry`] values and index helpers.
//! - The two seams the walker needs from the outside: a frame source
//!   ([`FrameAlloc`]) and a physical-to-virtual window ([`PhysMapper`]).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry) → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! The walker in this crate only ever *creates* 4 KiB leaves. Huge leaves
//! found in tables built elsewhere are honoured by [`AddressSpace::translate`]
//! and refused by the mutating operations.
//!
//! ### Recursive slot
//!
//! PML4 entry [`RECURSIVE_SLOT`](kernel_info::memory::RECURSIVE_SLOT) points
//! back at the PML4 itself, which exposes every table of the active space
//! through ordinary virtual addresses. The window is reserved: mapping into
//! it is rejected.
//!
//! ### Table access
//!
//! Tables are never held as long-lived references. Every access converts the
//! table's physical frame through the [`PhysMapper`], so the same code runs
//! against the kernel's direct map and against simulated RAM in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
mod flags;
pub mod page_table;

pub use crate::address_space::{
    AccessError, AddressSpace, FileBacking, MapError, MapFlags, MemoryRegion, Protection,
    RegionError, RegionKind,
};
pub use crate::flags::PageFlags;
pub use crate::page_table::{PageTable, PageTableEntry};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// Source of zeroable 4 KiB frames for page-table pages.
pub trait FrameAlloc {
    /// Hand out one frame, or `None` when memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame previously obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalFrame);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        (**self).alloc_frame()
    }

    #[inline]
    fn free_frame(&mut self, frame: PhysicalFrame) {
        (**self).free_frame(frame);
    }
}

/// Makes physical memory addressable.
///
/// In the kernel this adds the higher-half direct-map offset; in tests it
/// indexes into a host allocation.
pub trait PhysMapper {
    /// View the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// `pa` must be mapped, suitably aligned for `T` and hold a valid `T`.
    /// The caller must not create overlapping mutable views.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Shared variant of [`phys_to_mut`](Self::phys_to_mut).
    ///
    /// # Safety
    /// Same as [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        unsafe { self.phys_to_mut(pa) }
    }

    /// View `len` bytes starting at `pa`.
    ///
    /// # Safety
    /// The whole range must be mapped and not otherwise borrowed.
    unsafe fn phys_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let first: &mut u8 = unsafe { self.phys_to_mut(pa) };
        unsafe { core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len) }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// Borrow the table stored in `frame`.
///
/// # Safety
/// `frame` must hold a page table and no other reference to it may be live.
#[inline]
pub(crate) unsafe fn table_mut<'a, M: PhysMapper + ?Sized>(
    mapper: &M,
    frame: PhysicalFrame,
) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(frame.base()) }
}
