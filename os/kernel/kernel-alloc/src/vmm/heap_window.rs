use crate::bitmap::Bitmap;
use crate::vmm::VmmError;
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_PAGES};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, Size4K, VirtualAddress, frames_for};
use kernel_vmem::PhysMapper;

/// Page-granular reservation map of the kernel heap window
/// `[KERNEL_HEAP_BASE, KERNEL_HEAP_LIMIT)`. One bit per page, set = reserved.
pub struct HeapWindow {
    pages: Bitmap,
    storage: PhysicalFrame,
    reserved: u64,
}

impl HeapWindow {
    /// Frames needed for the bitmap.
    pub const STORAGE_FRAMES: u64 = frames_for(Bitmap::words_for(KERNEL_HEAP_PAGES) * 8);

    /// # Safety
    /// `storage` must be the first of [`STORAGE_FRAMES`](Self::STORAGE_FRAMES)
    /// frames owned by the caller and reachable through `mapper`.
    #[must_use]
    pub unsafe fn new<M: PhysMapper + ?Sized>(storage: PhysicalFrame, mapper: &M) -> Self {
        let words: &'static mut [u64] = unsafe {
            let first: &mut u64 = mapper.phys_to_mut(storage.base());
            core::slice::from_raw_parts_mut(
                core::ptr::from_mut(first),
                Bitmap::words_for(KERNEL_HEAP_PAGES) as usize,
            )
        };
        Self {
            pages: Bitmap::new(words, KERNEL_HEAP_PAGES, false),
            storage,
            reserved: 0,
        }
    }

    /// Lowest free run of `count` pages, now marked reserved.
    pub fn reserve(&mut self, count: u64) -> Option<VirtualAddress> {
        let first = self.pages.find_clear_run(0..KERNEL_HEAP_PAGES, count)?;
        for i in first..first + count {
            self.pages.set(i);
        }
        self.reserved += count;
        Some(Self::address_of(first))
    }

    /// Return `count` pages starting at `va`.
    ///
    /// # Errors
    /// [`VmmError::NotAllocated`] if the range leaves the window or any page
    /// of it is not reserved. Nothing changes in that case.
    pub fn release(&mut self, va: VirtualAddress, count: u64) -> Result<(), VmmError> {
        let first = self.index_of(va).ok_or(VmmError::NotAllocated(va))?;
        let end = first
            .checked_add(count)
            .filter(|&end| end <= KERNEL_HEAP_PAGES)
            .ok_or(VmmError::NotAllocated(va))?;
        if let Some(i) = (first..end).find(|&i| !self.pages.is_set(i)) {
            return Err(VmmError::NotAllocated(Self::address_of(i)));
        }
        for i in first..end {
            self.pages.clear(i);
        }
        self.reserved -= count;
        Ok(())
    }

    #[must_use]
    pub fn is_reserved(&self, va: VirtualAddress) -> bool {
        self.index_of(va).is_some_and(|i| self.pages.is_set(i))
    }

    #[inline]
    #[must_use]
    pub const fn reserved_pages(&self) -> u64 {
        self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn storage(&self) -> PhysicalFrame {
        self.storage
    }

    fn index_of(&self, va: VirtualAddress) -> Option<u64> {
        if !va.is_aligned::<Size4K>() {
            return None;
        }
        let i = va.as_u64().checked_sub(KERNEL_HEAP_BASE)? / PAGE_SIZE;
        (i < self.pages.len()).then_some(i)
    }

    const fn address_of(i: u64) -> VirtualAddress {
        VirtualAddress::new(KERNEL_HEAP_BASE + i * PAGE_SIZE)
    }
}
