//! # Memory Manager Context
//!
//! One explicit object holding the frame allocator and the VMM, each behind
//! its own [`SpinLock`]. Every method takes the locks it needs with
//! [`SpinLock::lock_irq`], so interrupts stay off while a lock is held and
//! an interrupt handler that allocates cannot deadlock against the code it
//! interrupted.
//!
//! Lock order is always VMM, then PMM.
//!
//! ```ignore
//! static MEMORY: Once<MemoryManager<HhdmPhysMapper>> = Once::new();
//!
//! let mm = unsafe { MemoryManager::init(&map, &exe, hhdm, HhdmPhysMapper::new(hhdm)) }
//!     .unwrap_or_else(|e| panic!("memory init failed: {e}"));
//! unsafe { mm.activate_kernel_space() };
//! ```

use crate::frame_alloc::{BitmapFrameAllocator, PmmError, Zone, ZoneStats};
use crate::slab::PageProvider;
use crate::vmm::{Vmm, VmmError};
use core::ptr::NonNull;
use kernel_info::boot::{ExecutableLocation, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, MemoryRegion, PageFlags, PhysMapper};
use log::info;

pub struct MemoryManager<M: PhysMapper> {
    vmm: SpinLock<Vmm<M>>,
    pmm: SpinLock<BitmapFrameAllocator>,
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Bring up the frame allocator, then the kernel address space.
    ///
    /// # Errors
    /// Initialization errors of either layer; the kernel cannot continue.
    ///
    /// # Safety
    /// See [`BitmapFrameAllocator::init`] and [`Vmm::init`].
    pub unsafe fn init(
        map: &[MemoryMapEntry],
        exe: &ExecutableLocation,
        hhdm_offset: u64,
        mapper: M,
    ) -> Result<Self, VmmError> {
        let mut pmm = unsafe { BitmapFrameAllocator::init(map, &mapper)? };
        let vmm = unsafe { Vmm::init(map, exe, hhdm_offset, mapper, &mut pmm)? };
        info!(
            "Memory manager ready: {} of {} frames free",
            pmm.free_page_count(),
            pmm.total_page_count()
        );
        Ok(Self::from_parts(vmm, pmm))
    }

    #[must_use]
    pub const fn from_parts(vmm: Vmm<M>, pmm: BitmapFrameAllocator) -> Self {
        Self {
            vmm: SpinLock::new(vmm),
            pmm: SpinLock::new(pmm),
        }
    }

    /// # Safety
    /// See [`AddressSpace::activate`].
    pub unsafe fn activate_kernel_space(&self) {
        let vmm = self.vmm.lock_irq();
        unsafe { vmm.activate_kernel_space() };
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::alloc_page`].
    pub fn alloc_page(&self, zone: Zone) -> Result<PhysicalFrame, PmmError> {
        self.pmm.lock_irq().alloc_page(zone)
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::alloc_page_any`].
    pub fn alloc_page_any(&self) -> Result<PhysicalFrame, PmmError> {
        self.pmm.lock_irq().alloc_page_any()
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::free_page`].
    pub fn free_page(&self, frame: PhysicalFrame) -> Result<(), PmmError> {
        self.pmm.lock_irq().free_page(frame)
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::alloc_contiguous`].
    pub fn alloc_contiguous(&self, count: usize, zone: Zone) -> Result<PhysicalFrame, PmmError> {
        self.pmm.lock_irq().alloc_contiguous(count, zone)
    }

    /// # Errors
    /// See [`BitmapFrameAllocator::free_contiguous`].
    pub fn free_contiguous(&self, first: PhysicalFrame, count: usize) -> Result<(), PmmError> {
        self.pmm.lock_irq().free_contiguous(first, count)
    }

    #[must_use]
    pub fn page_is_used(&self, pa: PhysicalAddress) -> bool {
        self.pmm.lock_irq().page_is_used(pa)
    }

    #[must_use]
    pub fn zone_stats(&self, zone: Zone) -> ZoneStats {
        self.pmm.lock_irq().zone_stats(zone)
    }

    #[must_use]
    pub fn free_page_count(&self) -> u64 {
        self.pmm.lock_irq().free_page_count()
    }

    #[must_use]
    pub fn total_page_count(&self) -> u64 {
        self.pmm.lock_irq().total_page_count()
    }

    /// # Errors
    /// See [`Vmm::alloc_pages`].
    pub fn alloc_pages(
        &self,
        count: usize,
        contiguous: bool,
        zone: Option<Zone>,
    ) -> Result<VirtualAddress, VmmError> {
        let mut vmm = self.vmm.lock_irq();
        vmm.alloc_pages(&mut self.pmm.lock_irq(), count, contiguous, zone)
    }

    /// # Errors
    /// See [`Vmm::free_pages`].
    pub fn free_pages(&self, va: VirtualAddress, count: usize) -> Result<(), VmmError> {
        let mut vmm = self.vmm.lock_irq();
        vmm.free_pages(&mut self.pmm.lock_irq(), va, count)
    }

    /// # Errors
    /// See [`Vmm::map_kernel`].
    pub fn map_kernel(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let mut vmm = self.vmm.lock_irq();
        vmm.map_kernel(&mut self.pmm.lock_irq(), va, pa, flags)
    }

    /// # Errors
    /// See [`Vmm::unmap_kernel`].
    pub fn unmap_kernel(&self, va: VirtualAddress, free_physical: bool) -> Result<PhysicalFrame, VmmError> {
        let mut vmm = self.vmm.lock_irq();
        vmm.unmap_kernel(&mut self.pmm.lock_irq(), va, free_physical)
    }

    /// Translate through the kernel space. The VMM lock is held only for the walk.
    #[must_use]
    pub fn translate_kernel(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.lock_irq().translate_kernel(va)
    }

    /// # Errors
    /// See [`Vmm::map`].
    pub fn map(
        &self,
        space: &mut AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let vmm = self.vmm.lock_irq();
        vmm.map(&mut self.pmm.lock_irq(), space, va, pa, flags)
    }

    /// # Errors
    /// See [`Vmm::unmap`].
    pub fn unmap(
        &self,
        space: &mut AddressSpace,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalFrame, VmmError> {
        let vmm = self.vmm.lock_irq();
        vmm.unmap(&mut self.pmm.lock_irq(), space, va, free_physical)
    }

    #[must_use]
    pub fn translate(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.lock_irq().translate(space, va)
    }

    /// # Errors
    /// See [`Vmm::create_address_space`].
    pub fn create_address_space(&self) -> Result<AddressSpace, VmmError> {
        let vmm = self.vmm.lock_irq();
        vmm.create_address_space(&mut self.pmm.lock_irq())
    }

    pub fn destroy_address_space(&self, space: AddressSpace) {
        let vmm = self.vmm.lock_irq();
        vmm.destroy_address_space(&mut self.pmm.lock_irq(), space);
    }

    /// # Errors
    /// See [`Vmm::address_space_dup`].
    #[allow(clippy::unused_self)]
    pub fn address_space_dup(&self, dest: &mut AddressSpace, src: &AddressSpace) -> Result<usize, VmmError> {
        Vmm::<M>::address_space_dup(dest, src)
    }

    /// # Errors
    /// See [`Vmm::unmap_region`].
    pub fn unmap_region(&self, space: &mut AddressSpace, start: VirtualAddress) -> Result<MemoryRegion, VmmError> {
        let vmm = self.vmm.lock_irq();
        vmm.unmap_region(&mut self.pmm.lock_irq(), space, start)
    }

    /// Page source for slab caches; each call takes the locks briefly.
    #[must_use]
    pub const fn pages(&self) -> ManagedPages<'_, M> {
        ManagedPages { mm: self }
    }

    pub fn dump_stats(&self) {
        let heap_pages = self.vmm.lock_irq().heap().reserved_pages();
        let pmm = self.pmm.lock_irq();
        pmm.dump_stats();
        info!(
            "{} of {} frames free, {heap_pages} kernel heap pages in use",
            pmm.free_page_count(),
            pmm.total_page_count()
        );
    }
}

/// [`PageProvider`] over a shared [`MemoryManager`].
pub struct ManagedPages<'a, M: PhysMapper> {
    mm: &'a MemoryManager<M>,
}

impl<M: PhysMapper> PageProvider for ManagedPages<'_, M> {
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        let va = self.mm.alloc_pages(count, false, None).ok()?;
        NonNull::new(va.as_mut_ptr())
    }

    fn free_pages(&mut self, base: NonNull<u8>, count: usize) {
        // Logged by `Vmm::free_pages`.
        let _ = self.mm.free_pages(VirtualAddress::from_nonnull(base), count);
    }
}
