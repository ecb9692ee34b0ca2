#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAllocator, PageProvider, Vmm};
use kernel_info::boot::{ExecutableLocation, MemoryKind, MemoryMapEntry};
use kernel_info::memory::{HHDM_BASE, KERNEL_BASE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashSet;
use std::ptr::NonNull;

const PAGE: Layout = match Layout::from_size_align(4096, 4096) {
    Ok(l) => l,
    Err(_) => panic!("page layout"),
};

/// Physical memory `[0, len)` backed by a leaked, page-aligned host allocation.
#[derive(Copy, Clone)]
pub struct TestRam {
    base: NonNull<u8>,
    len: u64,
}

impl TestRam {
    pub fn new(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation");
        Self {
            base,
            len: bytes as u64,
        }
    }

    pub fn read_u64(&self, pa: u64) -> u64 {
        unsafe { *self.phys_to_ref::<u64>(PhysicalAddress::new(pa)) }
    }

    pub fn fill(&self, pa: u64, len: usize, byte: u8) {
        unsafe { self.phys_slice_mut(PhysicalAddress::new(pa), len) }.fill(byte);
    }

    pub fn bytes(&self, pa: u64, len: usize) -> &[u8] {
        unsafe { self.phys_slice_mut(PhysicalAddress::new(pa), len) }
    }
}

// The allocation is leaked; it outlives every thread of the test binary.
unsafe impl Send for TestRam {}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert!(pa.as_u64() < self.len, "{pa} outside simulated RAM");
        unsafe { &mut *self.base.as_ptr().add(pa.as_u64() as usize).cast::<T>() }
    }
}

pub const MIB: u64 = 0x10_0000;

/// A small PC: low memory with a reserved hole, the kernel image at 2 MiB,
/// usable RAM up to 20 MiB so both DMA zones are populated.
pub fn pc_memory_map() -> Vec<MemoryMapEntry> {
    vec![
        MemoryMapEntry::new(0, 0x9_F000, MemoryKind::Usable),
        MemoryMapEntry::new(0x9_F000, 0x6_1000, MemoryKind::Reserved),
        MemoryMapEntry::new(MIB, MIB, MemoryKind::Usable),
        MemoryMapEntry::new(2 * MIB, MIB, MemoryKind::ExecutableAndModules),
        MemoryMapEntry::new(3 * MIB, 13 * MIB, MemoryKind::Usable),
        MemoryMapEntry::new(16 * MIB, 4 * MIB, MemoryKind::Usable),
    ]
}

pub fn kernel_image() -> ExecutableLocation {
    ExecutableLocation {
        physical_base: PhysicalAddress::new(2 * MIB),
        virtual_base: VirtualAddress::new(KERNEL_BASE),
    }
}

/// Frame allocator and VMM booted on [`pc_memory_map`].
pub fn boot() -> (TestRam, BitmapFrameAllocator, Vmm<TestRam>) {
    let ram = TestRam::new((20 * MIB) as usize);
    let map = pc_memory_map();
    let mut pmm = unsafe { BitmapFrameAllocator::init(&map, &ram) }.unwrap();
    let vmm = unsafe { Vmm::init(&map, &kernel_image(), HHDM_BASE, ram, &mut pmm) }.unwrap();
    (ram, pmm, vmm)
}

/// Page source for slab caches backed by the host heap.
#[derive(Default)]
pub struct HostPages {
    live: HashSet<usize>,
    budget: Option<usize>,
}

impl HostPages {
    /// A source that hands out at most `pages` pages over its lifetime.
    pub fn with_budget(pages: usize) -> Self {
        Self {
            budget: Some(pages),
            ..Self::default()
        }
    }

    pub fn outstanding(&self) -> usize {
        self.live.len()
    }
}

impl PageProvider for HostPages {
    fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        assert_eq!(count, 1, "slabs are one page");
        if let Some(budget) = self.budget.as_mut() {
            *budget = budget.checked_sub(1)?;
        }
        let page = NonNull::new(unsafe { alloc_zeroed(PAGE) })?;
        self.live.insert(page.as_ptr() as usize);
        Some(page)
    }

    fn free_pages(&mut self, base: NonNull<u8>, count: usize) {
        assert_eq!(count, 1);
        assert!(self.live.remove(&(base.as_ptr() as usize)), "page returned twice");
        unsafe { dealloc(base.as_ptr(), PAGE) };
    }
}
