//! # Kernel Virtual Memory Manager
//!
//! Owns the bootstrap (kernel) [`AddressSpace`] and the reservation map of
//! the kernel heap window, and combines both with the frame allocator.
//!
//! ## Bootstrap layout built by [`Vmm::init`]
//!
//! ```text
//! 0x0000_0000_0010_0000 ┌──────────────────────────┐ identity, RWX
//!                       │  low window (1..64 MiB)  │
//! 0x0000_0000_0400_0000 └──────────────────────────┘
//! hhdm + base           ┌──────────────────────────┐ RW, NX, global
//!                       │  direct-mapped entries   │
//!                       └──────────────────────────┘
//! KERNEL_HEAP_BASE      ┌──────────────────────────┐ filled by alloc_pages
//!                       │  kernel heap window      │
//! KERNEL_HEAP_LIMIT     └──────────────────────────┘
//! virtual_base          ┌──────────────────────────┐ RWX, global
//!                       │  kernel image            │
//!                       └──────────────────────────┘
//! ```
//!
//! Every operation that needs frames borrows the [`BitmapFrameAllocator`]
//! explicitly, so the caller decides how the two are locked.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{frame_alloc::BitmapFrameAllocator, phys_mapper::HhdmPhysMapper, vmm::Vmm};
//! let mapper = HhdmPhysMapper::new(hhdm);
//! let mut pmm = unsafe { BitmapFrameAllocator::init(map, &mapper)? };
//! let mut vmm = unsafe { Vmm::init(map, &exe, hhdm, mapper, &mut pmm)? };
//! let page = vmm.alloc_pages(&mut pmm, 1, false, None)?;
//! let dma = vmm.alloc_pages(&mut pmm, 4, true, Some(Zone::Dma32))?;
//! ```

mod heap_window;

pub use crate::vmm::heap_window::HeapWindow;
use crate::frame_alloc::{BitmapFrameAllocator, PmmError, Zone};
use crate::slab::PageProvider;
use core::ptr::NonNull;
use kernel_info::boot::{ExecutableLocation, MemoryKind, MemoryMapEntry};
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_LIMIT, LOW_IDENTITY_END, LOW_IDENTITY_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, frames_for};
use kernel_vmem::{AddressSpace, MapError, MemoryRegion, PageFlags, PhysMapper, RegionError};
use log::{debug, error, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("the kernel heap window has no run of {0} free pages")]
    OutOfVirtualSpace(usize),
    #[error("{0} is not an allocated kernel heap page")]
    NotAllocated(VirtualAddress),
    #[error("no executable entry of the memory map holds the kernel image at {0}")]
    ImageNotFound(PhysicalAddress),
    #[error("the kernel image at {0} overlaps the kernel heap window")]
    ImageOverlapsHeap(VirtualAddress),
    #[error("page count must be non-zero")]
    InvalidCount,
}

/// Direct-map aliases never hold code.
const HHDM_FLAGS: PageFlags = PageFlags::KERNEL_RW
    .union(PageFlags::GLOBAL)
    .union(PageFlags::NO_EXECUTE);

const IMAGE_FLAGS: PageFlags = PageFlags::KERNEL_RW.union(PageFlags::GLOBAL);

const HEAP_FLAGS: PageFlags = PageFlags::KERNEL_RW.union(PageFlags::NO_EXECUTE);

pub struct Vmm<M: PhysMapper> {
    mapper: M,
    kernel: AddressSpace,
    heap: HeapWindow,
}

impl<M: PhysMapper> Vmm<M> {
    /// Build the kernel address space and the heap window.
    ///
    /// The image is mapped from `exe.physical_base` to the end of the
    /// executable memory map entry holding it. Every kernel-half PML4 slot
    /// receives a PDPT up front, so task spaces created later share all
    /// future kernel mappings. The space is not activated.
    ///
    /// # Errors
    /// Any failure here is fatal for the kernel: no frames for tables,
    /// a kernel image the memory map does not describe, or an image that
    /// would collide with the heap window.
    ///
    /// # Safety
    /// `mapper` must reach every frame `frames` hands out.
    pub unsafe fn init(
        map: &[MemoryMapEntry],
        exe: &ExecutableLocation,
        hhdm_offset: u64,
        mapper: M,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<Self, VmmError> {
        let image = map
            .iter()
            .find(|e| {
                e.kind == MemoryKind::ExecutableAndModules
                    && e.base <= exe.physical_base
                    && exe.physical_base.as_u64() < e.end()
            })
            .ok_or(VmmError::ImageNotFound(exe.physical_base))?;
        let image_pages = frames_for(image.end() - exe.physical_base.as_u64());
        let image_end = exe.virtual_base.as_u64() + image_pages * PAGE_SIZE;
        if exe.virtual_base.as_u64() < KERNEL_HEAP_LIMIT && image_end > KERNEL_HEAP_BASE {
            return Err(VmmError::ImageOverlapsHeap(exe.virtual_base));
        }

        let mut kernel = AddressSpace::new(&mapper, frames)?;
        let pdpts = kernel.populate_kernel_half(&mapper, frames)?;

        for pa in (LOW_IDENTITY_START..LOW_IDENTITY_END).step_by(PAGE_SIZE as usize) {
            kernel.try_map(
                &mapper,
                frames,
                VirtualAddress::new(pa),
                PhysicalAddress::new(pa),
                PageFlags::KERNEL_RW,
            )?;
        }

        let mut direct = 0;
        for entry in map.iter().filter(|e| e.kind.is_direct_mapped()) {
            for frame in entry.touched_frames().map(PhysicalFrame::from_index) {
                let va = VirtualAddress::new(hhdm_offset + frame.base().as_u64());
                match kernel.try_map(&mapper, frames, va, frame.base(), HHDM_FLAGS) {
                    Ok(()) => direct += 1,
                    Err(MapError::AlreadyMapped(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for i in 0..image_pages {
            kernel.try_map(
                &mapper,
                frames,
                exe.virtual_base + i * PAGE_SIZE,
                exe.physical_base + i * PAGE_SIZE,
                IMAGE_FLAGS,
            )?;
        }

        let storage = frames.alloc_contiguous_any(HeapWindow::STORAGE_FRAMES as usize)?;
        let heap = unsafe { HeapWindow::new(storage, &mapper) };

        info!(
            "Kernel address space {}: {pdpts} kernel PDPTs, {direct} direct-mapped pages, {image_pages} image pages at {}",
            kernel.root(),
            exe.virtual_base
        );
        Ok(Self {
            mapper,
            kernel,
            heap,
        })
    }

    /// Load CR3 with the kernel space.
    ///
    /// # Safety
    /// See [`AddressSpace::activate`].
    pub unsafe fn activate_kernel_space(&self) {
        unsafe { self.kernel.activate() }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &HeapWindow {
        &self.heap
    }

    /// Map one page into the kernel space, replacing a present leaf.
    ///
    /// # Errors
    /// See [`AddressSpace::map`].
    pub fn map_kernel(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        Ok(self.kernel.map(&self.mapper, frames, va, pa, flags)?)
    }

    /// # Errors
    /// See [`AddressSpace::unmap`].
    pub fn unmap_kernel(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalFrame, VmmError> {
        Ok(self.kernel.unmap(&self.mapper, frames, va, free_physical)?)
    }

    #[must_use]
    pub fn translate_kernel(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel.translate(&self.mapper, va)
    }

    /// Map one page into `space`, replacing a present leaf.
    ///
    /// # Errors
    /// See [`AddressSpace::map`].
    pub fn map(
        &self,
        frames: &mut BitmapFrameAllocator,
        space: &mut AddressSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        Ok(space.map(&self.mapper, frames, va, pa, flags)?)
    }

    /// # Errors
    /// See [`AddressSpace::unmap`].
    pub fn unmap(
        &self,
        frames: &mut BitmapFrameAllocator,
        space: &mut AddressSpace,
        va: VirtualAddress,
        free_physical: bool,
    ) -> Result<PhysicalFrame, VmmError> {
        Ok(space.unmap(&self.mapper, frames, va, free_physical)?)
    }

    #[must_use]
    pub fn translate(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        space.translate(&self.mapper, va)
    }

    /// Allocate `count` zeroed pages and map them into the kernel heap window.
    ///
    /// With `contiguous` the backing frames are physically consecutive, so
    /// the buffer can be handed to a DMA engine. `zone` pins every backing
    /// frame to one zone, for devices that only address low memory; `None`
    /// takes frames in the usual Normal, DMA32, DMA order. Nothing stays
    /// allocated on failure.
    ///
    /// # Errors
    /// [`VmmError::InvalidCount`], [`VmmError::OutOfVirtualSpace`], or the
    /// frame allocator or mapping error that stopped the allocation.
    pub fn alloc_pages(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        count: usize,
        contiguous: bool,
        zone: Option<Zone>,
    ) -> Result<VirtualAddress, VmmError> {
        if count == 0 {
            return Err(VmmError::InvalidCount);
        }
        let va = self
            .heap
            .reserve(count as u64)
            .ok_or(VmmError::OutOfVirtualSpace(count))?;

        let backed = if contiguous {
            self.back_contiguous(frames, va, count, zone)
        } else {
            self.back_scattered(frames, va, count, zone)
        };
        if let Err(e) = backed {
            debug!("Allocation of {count} kernel pages failed: {e}");
            // Reserved above, cannot fail.
            let _ = self.heap.release(va, count as u64);
            return Err(e);
        }

        debug!("Allocated {count} kernel pages at {va}");
        Ok(va)
    }

    /// Unmap `count` pages from [`alloc_pages`](Self::alloc_pages) and free their frames.
    ///
    /// # Errors
    /// [`VmmError::InvalidCount`], or [`VmmError::NotAllocated`] if any page
    /// of the range is not currently allocated. Nothing changes on error.
    pub fn free_pages(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        va: VirtualAddress,
        count: usize,
    ) -> Result<(), VmmError> {
        if count == 0 {
            return Err(VmmError::InvalidCount);
        }
        self.heap
            .release(va, count as u64)
            .inspect_err(|e| error!("Cannot free {count} kernel pages at {va}: {e}"))?;
        let end = va + count as u64 * PAGE_SIZE;
        self.kernel.unmap_range(&self.mapper, frames, va, end, true);
        debug!("Freed {count} kernel pages at {va}");
        Ok(())
    }

    fn back_contiguous(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        va: VirtualAddress,
        count: usize,
        zone: Option<Zone>,
    ) -> Result<(), VmmError> {
        let first = match zone {
            Some(zone) => frames.alloc_contiguous(count, zone)?,
            None => frames.alloc_contiguous_any(count)?,
        };
        unsafe {
            self.mapper
                .phys_slice_mut(first.base(), count * PAGE_SIZE as usize)
                .fill(0);
        }
        for i in 0..count as u64 {
            let mapped = self.kernel.try_map(
                &self.mapper,
                frames,
                va + i * PAGE_SIZE,
                first.base() + i * PAGE_SIZE,
                HEAP_FLAGS,
            );
            if let Err(e) = mapped {
                self.kernel
                    .unmap_range(&self.mapper, frames, va, va + i * PAGE_SIZE, false);
                frames.free_contiguous(first, count)?;
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn back_scattered(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        va: VirtualAddress,
        count: usize,
        zone: Option<Zone>,
    ) -> Result<(), VmmError> {
        for i in 0..count as u64 {
            let page = va + i * PAGE_SIZE;
            if let Err(e) = self.back_page(frames, page, zone) {
                self.kernel.unmap_range(&self.mapper, frames, va, page, true);
                return Err(e);
            }
        }
        Ok(())
    }

    fn back_page(
        &mut self,
        frames: &mut BitmapFrameAllocator,
        page: VirtualAddress,
        zone: Option<Zone>,
    ) -> Result<(), VmmError> {
        let frame = match zone {
            Some(zone) => frames.alloc_page(zone)?,
            None => frames.alloc_page_any()?,
        };
        unsafe { self.mapper.phys_slice_mut(frame.base(), PAGE_SIZE as usize) }.fill(0);
        if let Err(e) = self
            .kernel
            .try_map(&self.mapper, frames, page, frame.base(), HEAP_FLAGS)
        {
            let _ = frames.free_page(frame);
            return Err(e.into());
        }
        Ok(())
    }

    /// A new task space sharing the kernel's upper half.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is left for the root.
    pub fn create_address_space(
        &self,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<AddressSpace, VmmError> {
        Ok(AddressSpace::new_sharing_kernel(&self.mapper, frames, &self.kernel)?)
    }

    /// Release the regions and private page tables of `space`.
    pub fn destroy_address_space(&self, frames: &mut BitmapFrameAllocator, space: AddressSpace) {
        space.destroy(&self.mapper, frames, &self.kernel);
    }

    /// Copy the region list of `src` into `dest`.
    ///
    /// # Errors
    /// [`RegionError::Overlap`]; nothing is copied then.
    pub fn address_space_dup(dest: &mut AddressSpace, src: &AddressSpace) -> Result<usize, VmmError> {
        Ok(dest.duplicate_regions_from(src)?)
    }

    /// Remove the region starting at `start` from `space` and unmap it.
    ///
    /// # Errors
    /// [`RegionError::NotFound`].
    pub fn unmap_region(
        &self,
        frames: &mut BitmapFrameAllocator,
        space: &mut AddressSpace,
        start: VirtualAddress,
    ) -> Result<MemoryRegion, VmmError> {
        Ok(space.unmap_region(&self.mapper, frames, start)?)
    }
}

/// Kernel heap pages for a slab cache, drawn through a borrowed [`Vmm`].
pub struct KernelPages<'a, M: PhysMapper> {
    vmm: &'a mut Vmm<M>,
    frames: &'a mut BitmapFrameAllocator,
}

impl<'a, M: PhysMapper> KernelPages<'a, M> {
    pub const fn new(vmm: &'a mut Vmm<M>, frames: &'a mut BitmapFrameAllocator) -> Self {
        Self { vmm, frames }
    }
}

impl<M: PhysMapper> PageProvider for KernelPages<'_, M> {
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        let va = self.vmm.alloc_pages(self.frames, count, false, None).ok()?;
        NonNull::new(va.as_mut_ptr())
    }

    fn free_pages(&mut self, base: NonNull<u8>, count: usize) {
        // Logged by `Vmm::free_pages`.
        let _ = self
            .vmm
            .free_pages(self.frames, VirtualAddress::from_nonnull(base), count);
    }
}
