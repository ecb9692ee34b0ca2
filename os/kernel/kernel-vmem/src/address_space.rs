//! # Address Space (x86-64, PML4-rooted)
//!
//! One page-table hierarchy plus the list of [`MemoryRegion`]s declared in it.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new`] allocates a zeroed PML4 and installs the recursive slot.
//! - [`AddressSpace::map`] / [`AddressSpace::try_map`] install one 4 KiB leaf,
//!   creating missing intermediate tables on the way down.
//! - [`AddressSpace::unmap`] clears one leaf and optionally returns its frame.
//! - [`AddressSpace::translate`] is a read-only walk (handles huge leaves).
//! - [`AddressSpace::new_sharing_kernel`] and [`AddressSpace::destroy`] cover
//!   the lifetime of task spaces.
//!
//! ## Design
//!
//! - Intermediate entries are created present + writable, plus user when the
//!   leaf is user-accessible. The leaf flags alone decide effective access.
//! - Every leaf write is followed by a single-page TLB invalidation.
//! - `unsafe` is confined to viewing a table frame through the [`PhysMapper`].

mod region;

pub use crate::address_space::region::{
    AccessError, FileBacking, MapFlags, MemoryRegion, Protection, RegionError, RegionKind,
};
use crate::page_table::{ENTRIES_PER_TABLE, Level, PageTableEntry, TableIndex, split_indices};
use crate::{FrameAlloc, PageFlags, PageTable, PhysMapper, table_mut};
use alloc::vec::Vec;
use kernel_info::memory::RECURSIVE_SLOT;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalFrame, Size1G, Size2M, Size4K, VirtualAddress,
};
use kernel_registers::tlb;
use log::{debug, error, warn};

/// First PML4 slot of the higher half.
const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// Why a page-table mutation was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("virtual address {0} is not 4 KiB aligned")]
    UnalignedVirtual(VirtualAddress),
    #[error("physical address {0} is not 4 KiB aligned")]
    UnalignedPhysical(PhysicalAddress),
    #[error("virtual address {0} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("virtual address {0} lies in the recursive table window")]
    RecursiveWindow(VirtualAddress),
    #[error("no physical frame left for a page table")]
    OutOfFrames,
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is covered by a huge page at the {1} level")]
    HugePage(VirtualAddress, Level),
}

/// Handle to a single address space.
///
/// The handle owns the root frame and the region list. Page-table pages live
/// in physical memory and are reached through a [`PhysMapper`] on each call.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysicalFrame,
    regions: Vec<MemoryRegion>,
}

impl AddressSpace {
    /// Allocate a zeroed PML4 and point the recursive slot at it.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        mapper: &M,
        frames: &mut A,
    ) -> Result<Self, MapError> {
        let root = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
        let pml4 = unsafe { table_mut(mapper, root) };
        pml4.zero();
        pml4.set(
            TableIndex::from_usize(RECURSIVE_SLOT),
            PageTableEntry::table(root, false),
        );
        debug!("Created address space with root {root}");
        Ok(Self::from_root(root))
    }

    /// Wrap an existing, already initialized root table.
    #[inline]
    #[must_use]
    pub const fn from_root(root: PhysicalFrame) -> Self {
        Self {
            root,
            regions: Vec::new(),
        }
    }

    /// Physical frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// Load CR3 with this space's root.
    ///
    /// # Safety
    /// The space must map the currently executing code, stack and data.
    pub unsafe fn activate(&self) {
        let cr3 = kernel_registers::cr3::Cr3::from_frame(self.root);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            use kernel_registers::StoreRegisterUnsafe;
            cr3.store_unsafe();
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = cr3;
        debug!("Activated address space {}", self.root);
    }

    /// Map the 4 KiB page at `va` to `pa`.
    ///
    /// A present leaf is replaced with a warning; use [`try_map`](Self::try_map)
    /// to refuse instead.
    ///
    /// # Errors
    /// Misaligned, non-canonical or recursive-window addresses, a huge page on
    /// the path, or no frame for a missing table.
    pub fn map<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.install_leaf(mapper, frames, va, pa, flags, true)
    }

    /// Like [`map`](Self::map), but a present leaf is left alone.
    ///
    /// # Errors
    /// As [`map`](Self::map), plus [`MapError::AlreadyMapped`].
    pub fn try_map<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.install_leaf(mapper, frames, va, pa, flags, false)
    }

    fn install_leaf<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        overwrite: bool,
    ) -> Result<(), MapError> {
        check_target(va)?;
        let Some(frame) = PhysicalFrame::from_aligned(pa) else {
            return Err(MapError::UnalignedPhysical(pa));
        };

        let user = flags.contains(PageFlags::USER);
        let pt_frame = self.ensure_page_table(mapper, frames, va, user)?;
        let pt = unsafe { table_mut(mapper, pt_frame) };
        let i = split_indices(va).pt;

        let old = pt.get(i);
        if old.is_present() {
            if !overwrite {
                return Err(MapError::AlreadyMapped(va));
            }
            warn!("Remapping {va}: {old} replaced by {pa}");
        }

        pt.set(i, PageTableEntry::leaf(frame, flags));
        tlb::invalidate_page(va);
        Ok(())
    }

    /// Walk to the PT covering `va`, allocating zeroed tables where absent.
    fn ensure_page_table<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalFrame, MapError> {
        let idx = split_indices(va);
        let mut table = self.root;
        let mut level = Level::Pml4;

        while let Some(next) = level.next() {
            let t = unsafe { table_mut(mapper, table) };
            let i = idx.at(level);
            let entry = t.get(i);

            table = if !entry.is_present() {
                let fresh = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
                unsafe { table_mut(mapper, fresh) }.zero();
                t.set(i, PageTableEntry::table(fresh, user));
                debug!("Allocated {next} table {fresh} for {va}");
                fresh
            } else if entry.huge_page() {
                return Err(MapError::HugePage(va, level));
            } else {
                if user && !entry.user() {
                    t.set(i, entry.with_user(true));
                }
                PhysicalFrame::containing(entry.address())
            };
            level = next;
        }

        Ok(table)
    }

    /// Walk to the PT covering `va` without creating anything.
    fn find_page_table<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Result<PhysicalFrame, MapError> {
        let idx = split_indices(va);
        let mut table = self.root;
        let mut level = Level::Pml4;

        while let Some(next) = level.next() {
            let entry = unsafe { table_ref(mapper, table) }.get(idx.at(level));
            if !entry.is_present() {
                return Err(MapError::NotMapped(va));
            }
            if entry.huge_page() {
                return Err(MapError::HugePage(va, level));
            }
            table = PhysicalFrame::containing(entry.address());
            level = next;
        }

        Ok(table)
    }

    /// Remove the 4 KiB mapping covering `va`.
    ///
    /// With `free_physical` the backing frame goes back to `frames`. The
    /// unmapped frame is returned either way.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] (logged, nothing changes) when any level is
    /// absent; [`MapError::HugePage`] when a huge leaf covers `va`.
    pub fn unmap<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalFrame, MapError> {
        self.clear_leaf(mapper, frames, va, free_physical)
            .inspect_err(|e| error!("Cannot unmap {va}: {e}"))
    }

    fn clear_leaf<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalFrame, MapError> {
        let pt_frame = self.find_page_table(mapper, va)?;
        let pt = unsafe { table_mut(mapper, pt_frame) };
        let i = split_indices(va).pt;

        let Some(frame) = pt.get(i).frame() else {
            return Err(MapError::NotMapped(va));
        };

        pt.set(i, PageTableEntry::absent());
        tlb::invalidate_page(va.page::<Size4K>().base());

        if free_physical {
            frames.free_frame(frame);
        }
        Ok(frame)
    }

    /// Unmap every mapped page in `[start, end)`; holes are skipped silently.
    ///
    /// Returns the number of pages unmapped.
    pub fn unmap_range<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
        free_physical: bool,
    ) -> usize {
        let mut unmapped = 0;
        let mut va = start.page::<Size4K>().base();
        while va < end {
            if self.clear_leaf(mapper, frames, va, free_physical).is_ok() {
                unmapped += 1;
            }
            match va.checked_add(PAGE_SIZE) {
                Some(next) => va = next,
                None => break,
            }
        }
        unmapped
    }

    /// Translate `va` to a physical address, or `None` if not mapped.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the in-page offset of that size.
    #[must_use]
    pub fn translate<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        if !va.is_canonical() {
            return None;
        }
        let idx = split_indices(va);

        let pml4 = unsafe { table_ref(mapper, self.root) };
        let pdpt = unsafe { table_ref(mapper, pml4.get(idx.pml4).frame()?) };

        let e3 = pdpt.get(idx.pdpt);
        if !e3.is_present() {
            return None;
        }
        if e3.huge_page() {
            return Some(e3.address().page::<Size1G>().join(va.offset::<Size1G>()));
        }

        let pd = unsafe { table_ref(mapper, PhysicalFrame::containing(e3.address())) };
        let e2 = pd.get(idx.pd);
        if !e2.is_present() {
            return None;
        }
        if e2.huge_page() {
            return Some(e2.address().page::<Size2M>().join(va.offset::<Size2M>()));
        }

        let pt = unsafe { table_ref(mapper, PhysicalFrame::containing(e2.address())) };
        let leaf = pt.get(idx.pt).frame()?;
        Some(leaf.join(va.offset::<Size4K>()))
    }

    /// Give every empty kernel-half PML4 slot a zeroed PDPT.
    ///
    /// Spaces built by [`new_sharing_kernel`](Self::new_sharing_kernel) copy
    /// the kernel's top-level entries once. With every slot already present,
    /// later kernel mappings land in shared lower-level tables and stay
    /// visible to those spaces. Returns the number of tables allocated.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a table cannot be allocated. Tables
    /// installed before the failure stay in place.
    pub fn populate_kernel_half<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
    ) -> Result<usize, MapError> {
        let pml4 = unsafe { table_mut(mapper, self.root) };
        let mut added = 0;
        for slot in (KERNEL_HALF_START..ENTRIES_PER_TABLE).filter(|&s| s != RECURSIVE_SLOT) {
            let i = TableIndex::from_usize(slot);
            if pml4.get(i).is_present() {
                continue;
            }
            let fresh = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
            unsafe { table_mut(mapper, fresh) }.zero();
            pml4.set(i, PageTableEntry::table(fresh, false));
            added += 1;
        }
        debug!("Populated kernel half of {} with {added} PDPTs", self.root);
        Ok(added)
    }

    /// A fresh space that shares the kernel half of `kernel`.
    ///
    /// Higher-half PML4 entries are copied by value so both spaces point at
    /// the same lower-level tables. The recursive slot refers to the new root.
    /// Only slots present in `kernel` at this point are shared; call
    /// [`populate_kernel_half`](Self::populate_kernel_half) on the kernel
    /// space first so none are added afterwards.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new_sharing_kernel<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        mapper: &M,
        frames: &mut A,
        kernel: &Self,
    ) -> Result<Self, MapError> {
        let space = Self::new(mapper, frames)?;
        let src = unsafe { table_ref(mapper, kernel.root) };
        let dst = unsafe { table_mut(mapper, space.root) };

        for slot in (KERNEL_HALF_START..ENTRIES_PER_TABLE).filter(|&s| s != RECURSIVE_SLOT) {
            let i = TableIndex::from_usize(slot);
            dst.set(i, src.get(i));
        }
        Ok(space)
    }

    /// Tear the space down.
    ///
    /// Every region is unmapped (anonymous frames are freed), then every
    /// page-table page not shared with `kernel` is returned, root included.
    /// Leaves mapped outside any region keep their frames.
    pub fn destroy<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        mut self,
        mapper: &M,
        frames: &mut A,
        kernel: &Self,
    ) {
        if self.root == kernel.root {
            error!("Refusing to destroy the kernel address space");
            return;
        }

        for region in core::mem::take(&mut self.regions) {
            self.unmap_range(mapper, frames, region.start, region.end, region.kind.owns_frames());
        }

        let shared = unsafe { table_ref(mapper, kernel.root) };
        let pml4 = unsafe { table_ref(mapper, self.root) };
        let mut tables = 0;
        for (i, entry) in pml4.present_entries() {
            if i.as_usize() == RECURSIVE_SLOT || shared.get(i).frame() == entry.frame() {
                continue;
            }
            if let Some(next) = entry.frame() {
                tables += free_tables(mapper, frames, next, Level::Pdpt);
            }
        }
        frames.free_frame(self.root);
        debug!(
            "Destroyed address space {}, released {} table pages",
            self.root,
            tables + 1
        );
    }
}

/// Free the table in `frame` and all tables below it; leaves are untouched.
fn free_tables<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
    mapper: &M,
    frames: &mut A,
    frame: PhysicalFrame,
    level: Level,
) -> usize {
    let mut freed = 1;
    if let Some(next) = level.next() {
        let table = unsafe { table_ref(mapper, frame) };
        for (_, entry) in table.present_entries().filter(|(_, e)| !e.huge_page()) {
            freed += free_tables(mapper, frames, PhysicalFrame::containing(entry.address()), next);
        }
    }
    frames.free_frame(frame);
    freed
}

fn check_target(va: VirtualAddress) -> Result<(), MapError> {
    if !va.is_aligned::<Size4K>() {
        return Err(MapError::UnalignedVirtual(va));
    }
    if !va.is_canonical() {
        return Err(MapError::NonCanonical(va));
    }
    if split_indices(va).pml4.as_usize() == RECURSIVE_SLOT {
        return Err(MapError::RecursiveWindow(va));
    }
    Ok(())
}

#[inline]
unsafe fn table_ref<'a, M: PhysMapper + ?Sized>(mapper: &M, frame: PhysicalFrame) -> &'a PageTable {
    unsafe { mapper.phys_to_ref::<PageTable>(frame.base()) }
}
